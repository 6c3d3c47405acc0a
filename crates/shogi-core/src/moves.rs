use serde::{Deserialize, Serialize};

use crate::board::{Board, Hands, Piece, PieceKind, Side, Square};

/// A move as received from a client. Untrusted until validated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Move {
    /// Moving a piece already on the board.
    Board {
        from: Square,
        to: Square,
        promote: bool,
    },
    /// Placing a piece from hand onto an empty square.
    Drop { to: Square, piece: PieceKind },
}

impl Move {
    pub fn to(&self) -> Square {
        match self {
            Move::Board { to, .. } | Move::Drop { to, .. } => *to,
        }
    }
}

/// Time spent on a move, in whole seconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveTime {
    /// Seconds consumed by this move.
    pub now: u64,
    /// Cumulative seconds consumed by the mover this game.
    pub total: u64,
}

/// A move as recorded in a room's history.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedMove {
    #[serde(flatten)]
    pub mv: Move,
    /// Whether the move left the opponent in check.
    pub is_check: bool,
    pub time: MoveTime,
}

/// Applies a move for `side`, returning the resulting board and hands.
///
/// Assumes the move has been validated: the source square holds the
/// mover's piece (board move) or the hand holds the dropped kind (drop).
/// A captured piece enters the mover's hand demoted.
pub fn apply_move(board: &Board, hands: &Hands, side: Side, mv: Move) -> (Board, Hands) {
    let mut board = *board;
    let mut hands = *hands;

    match mv {
        Move::Board { from, to, promote } => {
            let moved = board[from.y][from.x].take();
            if let Some(moved) = moved {
                if let Some(captured) = board[to.y][to.x] {
                    hands.add(side, captured.kind);
                }
                let kind = if promote {
                    moved.kind.promote().unwrap_or(moved.kind)
                } else {
                    moved.kind
                };
                board[to.y][to.x] = Some(Piece::new(kind, moved.owner));
            }
        }
        Move::Drop { to, piece } => {
            hands.remove(side, piece);
            board[to.y][to.x] = Some(Piece::new(piece, side));
        }
    }

    (board, hands)
}

/// Replays a history prefix from the initial position.
///
/// Sides alternate from Sente; move i belongs to Sente iff i is even.
pub fn replay(moves: &[RecordedMove]) -> (Board, Hands) {
    let mut board = crate::board::initial_board();
    let mut hands = Hands::empty();
    let mut side = Side::Sente;

    for record in moves {
        let (b, h) = apply_move(&board, &hands, side, record.mv);
        board = b;
        hands = h;
        side = side.flip();
    }

    (board, hands)
}

/// The side that made move `index` of a history.
pub fn mover_at(index: usize) -> Side {
    if index % 2 == 0 {
        Side::Sente
    } else {
        Side::Gote
    }
}

/// The side to move after `len` moves have been played.
pub fn side_to_move(len: usize) -> Side {
    mover_at(len)
}
