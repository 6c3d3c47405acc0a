use std::fmt::Write as _;

use crate::board::{Board, Hands, Side, HAND_KINDS};

/// Canonical position fingerprint: board, side to move, and both hands.
///
/// Rank-major run-length board string with `/` between ranks, lowercase
/// for Gote and a `+` prefix for promoted kinds, then ` b `/` w ` for the
/// side to move, then each hand in the fixed `HAND_KINDS` order as
/// `<letter><count>` pairs (zero counts omitted, `-` when empty), Sente
/// first, `/` between the hands.
///
/// Two positions are game-equivalent iff their fingerprints are equal.
pub fn position_key(board: &Board, side: Side, hands: &Hands) -> String {
    let mut out = String::new();

    for y in 0..9 {
        if y > 0 {
            out.push('/');
        }
        let mut empties = 0;
        for x in 0..9 {
            match board[y][x] {
                None => empties += 1,
                Some(piece) => {
                    if empties > 0 {
                        let _ = write!(out, "{empties}");
                        empties = 0;
                    }
                    if piece.kind.is_promoted() {
                        out.push('+');
                    }
                    let letter = piece.kind.letter();
                    out.push(match piece.owner {
                        Side::Sente => letter,
                        Side::Gote => letter.to_ascii_lowercase(),
                    });
                }
            }
        }
        if empties > 0 {
            let _ = write!(out, "{empties}");
        }
    }

    out.push(' ');
    out.push(match side {
        Side::Sente => 'b',
        Side::Gote => 'w',
    });
    out.push(' ');

    for (i, owner) in [Side::Sente, Side::Gote].into_iter().enumerate() {
        if i > 0 {
            out.push('/');
        }
        let mut any = false;
        for kind in HAND_KINDS {
            let count = hands.count(owner, kind);
            if count > 0 {
                let _ = write!(out, "{}{}", kind.letter(), count);
                any = true;
            }
        }
        if !any {
            out.push('-');
        }
    }

    out
}
