use crate::board::{Hands, Side};
use crate::moves::{apply_move, mover_at, side_to_move, RecordedMove};
use crate::sfen::position_key;

/// How a fourfold repetition ends the game.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RepetitionVerdict {
    /// Plain sennichite, no winner.
    Draw,
    /// One side checked on every one of its moves between the last two
    /// occurrences; that side loses.
    PerpetualCheckBy(Side),
}

/// Classifies a repetition that the final move of `history` completed.
///
/// Recomputes the fingerprint after every prefix, with the initial
/// position counting as occurrence index -1. The examined block runs
/// from just after the previous occurrence of the current fingerprint
/// through the final move.
pub fn classify_repetition(history: &[RecordedMove]) -> RepetitionVerdict {
    if history.is_empty() {
        return RepetitionVerdict::Draw;
    }

    let mut board = crate::board::initial_board();
    let mut hands = Hands::empty();

    // keys[i] is the fingerprint after i moves; keys[0] is the initial
    // position (occurrence index -1 in history terms).
    let mut keys = Vec::with_capacity(history.len() + 1);
    keys.push(position_key(&board, Side::Sente, &hands));
    for (i, record) in history.iter().enumerate() {
        let (b, h) = apply_move(&board, &hands, mover_at(i), record.mv);
        board = b;
        hands = h;
        keys.push(position_key(&board, side_to_move(i + 1), &hands));
    }

    let current = keys.last().cloned().unwrap_or_default();
    let last_idx = history.len() - 1;
    // Previous occurrence, as a history index (-1 = initial position).
    let prev_idx = (0..keys.len() - 1)
        .rev()
        .find(|i| keys[*i] == current)
        .map(|i| i as isize - 1)
        .unwrap_or(-1);

    let block = ((prev_idx + 1) as usize)..=last_idx;
    let mut sente_moves = 0u32;
    let mut gote_moves = 0u32;
    let mut sente_all_checks = true;
    let mut gote_all_checks = true;
    for i in block {
        match mover_at(i) {
            Side::Sente => {
                sente_moves += 1;
                sente_all_checks &= history[i].is_check;
            }
            Side::Gote => {
                gote_moves += 1;
                gote_all_checks &= history[i].is_check;
            }
        }
    }

    if sente_moves > 0 && sente_all_checks {
        RepetitionVerdict::PerpetualCheckBy(Side::Sente)
    } else if gote_moves > 0 && gote_all_checks {
        RepetitionVerdict::PerpetualCheckBy(Side::Gote)
    } else {
        RepetitionVerdict::Draw
    }
}
