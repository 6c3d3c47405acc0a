use crate::board::{Board, Hands, Piece, PieceKind, Side, Square, HAND_KINDS};
use crate::moves::{apply_move, Move};

/// Every square strictly between `from` and `to` is empty.
///
/// Only called for straight or diagonal lines.
fn path_clear(board: &Board, from: Square, to: Square) -> bool {
    let dx = (to.x as i8 - from.x as i8).signum();
    let dy = (to.y as i8 - from.y as i8).signum();
    let mut x = from.x as i8 + dx;
    let mut y = from.y as i8 + dy;

    while (x, y) != (to.x as i8, to.y as i8) {
        if board[y as usize][x as usize].is_some() {
            return false;
        }
        x += dx;
        y += dy;
    }
    true
}

/// Whether `piece` standing on `from` attacks `to` on this board.
///
/// Ignores the occupant of `to`; blockers between the squares count.
pub fn can_reach(board: &Board, from: Square, to: Square, piece: Piece) -> bool {
    let dx = to.x as i8 - from.x as i8;
    let dy = to.y as i8 - from.y as i8;
    if dx == 0 && dy == 0 {
        return false;
    }
    let forward = piece.owner.forward();

    match piece.kind {
        PieceKind::King => dx.abs().max(dy.abs()) == 1,
        kind if kind.moves_like_gold() => {
            (dx.abs() == 1 && dy == 0)
                || (dx == 0 && dy.abs() == 1)
                || (dx.abs() == 1 && dy == forward)
        }
        PieceKind::Silver => {
            (dx.abs() == 1 && dy.abs() == 1) || (dx == 0 && dy == forward)
        }
        PieceKind::Knight => dx.abs() == 1 && dy == 2 * forward,
        PieceKind::Pawn => dx == 0 && dy == forward,
        PieceKind::Lance => {
            dx == 0 && dy.signum() == forward && path_clear(board, from, to)
        }
        PieceKind::Bishop => dx.abs() == dy.abs() && path_clear(board, from, to),
        PieceKind::Horse => {
            (dx.abs() == dy.abs() && path_clear(board, from, to))
                || dx.abs().max(dy.abs()) == 1
        }
        PieceKind::Rook => (dx == 0 || dy == 0) && path_clear(board, from, to),
        PieceKind::Dragon => {
            ((dx == 0 || dy == 0) && path_clear(board, from, to))
                || dx.abs().max(dy.abs()) == 1
        }
        _ => false,
    }
}

/// A square the kind could never move from again (forced-promotion ranks).
fn is_dead_square(kind: PieceKind, side: Side, y: usize) -> bool {
    let last = match side {
        Side::Sente => y == 0,
        Side::Gote => y == 8,
    };
    let last_two = match side {
        Side::Sente => y <= 1,
        Side::Gote => y >= 7,
    };
    match kind {
        PieceKind::Pawn | PieceKind::Lance => last,
        PieceKind::Knight => last_two,
        _ => false,
    }
}

fn in_promotion_zone(side: Side, y: usize) -> bool {
    match side {
        Side::Sente => y <= 2,
        Side::Gote => y >= 6,
    }
}

/// An unpromoted pawn of `side` already stands on file `x` (nifu).
fn has_pawn_on_file(board: &Board, side: Side, x: usize) -> bool {
    (0..9).any(|y| {
        board[y][x] == Some(Piece::new(PieceKind::Pawn, side))
    })
}

pub fn find_king(board: &Board, side: Side) -> Option<Square> {
    for y in 0..9 {
        for x in 0..9 {
            if board[y][x] == Some(Piece::new(PieceKind::King, side)) {
                return Some(Square::new(x, y));
            }
        }
    }
    None
}

/// Whether `side`'s king is attacked. A missing king is not in check.
pub fn is_king_in_check(board: &Board, side: Side) -> bool {
    let king = match find_king(board, side) {
        Some(sq) => sq,
        None => return false,
    };
    for y in 0..9 {
        for x in 0..9 {
            if let Some(piece) = board[y][x] {
                if piece.owner != side && can_reach(board, Square::new(x, y), king, piece) {
                    return true;
                }
            }
        }
    }
    false
}

/// Full move validation for `side`.
///
/// `check_drop_pawn_mate` disables the uchi-fu-zume test when this is
/// itself called on candidate responses, breaking the recursion.
pub fn is_legal(
    board: &Board,
    hands: &Hands,
    side: Side,
    mv: Move,
    check_drop_pawn_mate: bool,
) -> bool {
    let to = mv.to();
    if !to.in_bounds() {
        return false;
    }
    if let Some(occupant) = board[to.y][to.x] {
        if occupant.owner == side {
            return false;
        }
    }

    match mv {
        Move::Board { from, to, promote } => {
            if !from.in_bounds() {
                return false;
            }
            let piece = match board[from.y][from.x] {
                Some(p) if p.owner == side => p,
                _ => return false,
            };
            if promote {
                if piece.kind.promote().is_none() {
                    return false;
                }
                if !in_promotion_zone(side, from.y) && !in_promotion_zone(side, to.y) {
                    return false;
                }
            } else if is_dead_square(piece.kind, side, to.y) {
                return false;
            }
            if !can_reach(board, from, to, piece) {
                return false;
            }
        }
        Move::Drop { to, piece } => {
            if board[to.y][to.x].is_some() {
                return false;
            }
            if hands.count(side, piece) == 0 || piece.is_promoted() {
                return false;
            }
            if is_dead_square(piece, side, to.y) {
                return false;
            }
            if piece == PieceKind::Pawn && has_pawn_on_file(board, side, to.x) {
                return false;
            }
        }
    }

    // No self-check.
    let (next_board, next_hands) = apply_move(board, hands, side, mv);
    if is_king_in_check(&next_board, side) {
        return false;
    }

    // Uchi-fu-zume: a pawn drop may not deliver checkmate.
    if check_drop_pawn_mate {
        if let Move::Drop {
            piece: PieceKind::Pawn,
            ..
        } = mv
        {
            let opponent = side.flip();
            if is_king_in_check(&next_board, opponent)
                && !has_legal_move(&next_board, &next_hands, opponent)
            {
                return false;
            }
        }
    }

    true
}

/// Whether `side` has any legal move, uchi-fu-zume test disabled.
fn has_legal_move(board: &Board, hands: &Hands, side: Side) -> bool {
    // Board moves.
    for y in 0..9 {
        for x in 0..9 {
            let from = Square::new(x, y);
            let piece = match board[y][x] {
                Some(p) if p.owner == side => p,
                _ => continue,
            };
            for ty in 0..9 {
                for tx in 0..9 {
                    let to = Square::new(tx, ty);
                    if !can_reach(board, from, to, piece) {
                        continue;
                    }
                    for promote in [false, true] {
                        let mv = Move::Board { from, to, promote };
                        if is_legal(board, hands, side, mv, false) {
                            return true;
                        }
                    }
                }
            }
        }
    }

    // Drops.
    for kind in HAND_KINDS {
        if hands.count(side, kind) == 0 {
            continue;
        }
        for y in 0..9 {
            for x in 0..9 {
                if board[y][x].is_some() {
                    continue;
                }
                let mv = Move::Drop {
                    to: Square::new(x, y),
                    piece: kind,
                };
                if is_legal(board, hands, side, mv, false) {
                    return true;
                }
            }
        }
    }

    false
}

/// Whether `side` is checkmated: in check with no legal response.
pub fn is_checkmate(board: &Board, hands: &Hands, side: Side) -> bool {
    is_king_in_check(board, side) && !has_legal_move(board, hands, side)
}
