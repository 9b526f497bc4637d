mod common;

use common::*;
use duskboy::{Button, Error, GameBoy, Model};
use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;

/// Scripted input: a different direction held every few frames.
fn input_for_frame(frame: usize) -> [(Button, bool); 4] {
    let phase = (frame / 7) % 4;
    [
        (Button::Right, phase == 0),
        (Button::Left, phase == 1),
        (Button::Up, phase == 2),
        (Button::Down, phase == 3 || frame % 5 == 0),
    ]
}

/// Runs frames with scripted input, and fingerprints what comes out of each one.
fn record(gb: &mut GameBoy, first_frame: usize, frames: usize) -> Vec<u64> {
    (first_frame..first_frame + frames)
        .map(|frame| {
            for (button, pressed) in input_for_frame(frame).iter() {
                gb.set_key_input(*button, *pressed);
            }
            gb.run_frame().unwrap();

            let mut hasher = DefaultHasher::new();
            hasher.write(gb.screen());
            for sample in gb.audio_samples() {
                hasher.write_i16(*sample);
            }
            hasher.write_u64(gb.hw.sched.now());
            hasher.finish()
        })
        .collect()
}

#[test]
fn restore_replays_identically() {
    let mut gb = boot(Model::Dmg, &BUSY_ROM);
    record(&mut gb, 0, 30);
    let state = gb.serialize().unwrap();

    let expected = record(&mut gb, 30, 600);
    assert_ne!(expected[0], expected[1], "the picture should be changing");

    gb.deserialize(&state).unwrap();
    assert_eq!(record(&mut gb, 30, 600), expected);
}

// A state can be loaded into a different session, as long as it has the same ROM loaded.
#[test]
fn restore_into_fresh_console() {
    let mut gb = boot(Model::Cgb, &BUSY_ROM);
    record(&mut gb, 0, 45);
    let state = gb.serialize().unwrap();
    let expected = record(&mut gb, 45, 120);

    let mut other = boot(Model::Cgb, &BUSY_ROM);
    other.deserialize(&state).unwrap();
    assert_eq!(other.frame_count(), 45);
    assert_eq!(record(&mut other, 45, 120), expected);
}

#[test]
fn serialize_is_stable() {
    let mut gb = boot(Model::Dmg, &BUSY_ROM);
    run_frames(&mut gb, 10);
    let state = gb.serialize().unwrap();
    gb.deserialize(&state).unwrap();
    assert_eq!(gb.serialize().unwrap(), state);
}

#[test]
fn bad_state_leaves_session_alone() {
    let mut gb = boot(Model::Dmg, &BUSY_ROM);
    run_frames(&mut gb, 3);
    let mut state = gb.serialize().unwrap();
    let now = gb.hw.sched.now();

    state[0] = b'X';
    assert!(matches!(gb.deserialize(&state), Err(Error::BadSaveState)));
    state[0] = b'D';
    state[4] = 0xFF;
    assert!(matches!(gb.deserialize(&state), Err(Error::SaveStateVersion { .. })));
    state[4] = 0x01;
    assert!(matches!(gb.deserialize(&state[..100]), Err(Error::SaveStateBody(_))));

    assert_eq!(gb.hw.sched.now(), now);
    gb.run_frame().unwrap();
}
