use std::{thread, time::Duration};

use chip8::prelude::*;

/// Program is paced by the clock rate, not by the tick rate of the driver.
#[test]
fn test_one_hertz_pacing() {
    let mut driver = Chip8Driver::new(Chip8Conf {
        clock_frequency: Some(Hz(1)),
        ..Default::default()
    });
    // ADD v0, 1 ; JP 0x200
    driver.load_bytecode(&[0x70, 0x01, 0x12, 0x00]).unwrap();

    let handle = driver.handle();
    let join = driver.spawn().unwrap();

    thread::sleep(Duration::from_millis(2100));
    handle.shutdown();
    let driver = join.join().unwrap();

    let count = handle.instruction_count();
    assert!((1..=3).contains(&count), "executed {count} instructions");
    assert_eq!(driver.vm().cpu().registers()[0] as u64, (count + 1) / 2);
}

#[test]
fn test_frame_from_other_thread() {
    let mut driver = Chip8Driver::new(Chip8Conf::default());
    #[rustfmt::skip]
    let program: &[u8] = &[
        0x60, 0x08, // LD v0, 8
        0xF0, 0x29, // LD F, v0
        0xD1, 0x15, // DRW v1, v1, 5
        0x12, 0x06, // JP self
    ];
    driver.load_bytecode(program).unwrap();

    let handle = driver.handle();
    let join = driver.spawn().unwrap();

    let renderer = {
        let handle = handle.clone();
        thread::spawn(move || {
            for _ in 0..100 {
                if handle.frame().lit_count() > 0 {
                    return handle.frame();
                }
                thread::sleep(Duration::from_millis(10));
            }
            handle.frame()
        })
    };

    let frame = renderer.join().unwrap();
    handle.shutdown();
    join.join().unwrap();

    // Glyph 8 is F0 90 F0 90 F0
    let expected = [0xF0u8, 0x90, 0xF0, 0x90, 0xF0];
    for (y, row) in expected.iter().enumerate() {
        for x in 0..8 {
            assert_eq!(frame.pixel(x, y), (row >> (7 - x)) & 1 == 1, "({x}, {y})");
        }
    }
    assert!(handle.debug_text().contains("PROGRAM COUNTER"));
}

#[test]
fn test_load_and_reset_through_handle() {
    let driver = Chip8Driver::new(Chip8Conf::default());
    let handle = driver.handle();
    let join = driver.spawn().unwrap();

    // Oversized programs are rejected on the caller's thread.
    let large = vec![0x00; 4000];
    assert!(matches!(
        handle.load_program(large.as_slice()),
        Err(Chip8Error::LargeProgram { size: 3585 })
    ));

    #[rustfmt::skip]
    let program: &[u8] = &[
        0x60, 0x00, // LD v0, 0
        0xF0, 0x29, // LD F, v0
        0xD0, 0x05, // DRW v0, v0, 5
        0x12, 0x06, // JP self
    ];
    handle.load_program(program).unwrap();
    thread::sleep(Duration::from_millis(200));
    assert_eq!(handle.frame().lit_count(), 14);

    handle.request_reset();
    thread::sleep(Duration::from_millis(200));
    // The program restarts from scratch and redraws the same glyph.
    assert_eq!(handle.frame().lit_count(), 14);
    assert!(handle.instruction_count() >= 6);

    handle.shutdown();
    let driver = join.join().unwrap();
    assert_eq!(driver.vm().cpu().pc(), 0x206);
}

#[test]
fn test_key_wait_does_not_block_driver() {
    let mut driver = Chip8Driver::new(Chip8Conf::default());
    #[rustfmt::skip]
    let program: &[u8] = &[
        0xF3, 0x0A, // LD v3, K
        0x12, 0x02, // JP self
    ];
    driver.load_bytecode(program).unwrap();

    let handle = driver.handle();
    let join = driver.spawn().unwrap();

    thread::sleep(Duration::from_millis(100));
    assert!(handle.is_running());
    handle.set_key(KeyCode::KeyB, true);
    thread::sleep(Duration::from_millis(100));
    handle.shutdown();

    let driver = join.join().unwrap();
    assert_eq!(driver.vm().cpu().registers()[3], 0xB);
    assert_eq!(driver.vm().status(), MachineStatus::Normal);
}

#[test]
fn test_clock_rate_live_change() {
    let driver = Chip8Driver::new(Chip8Conf {
        max_clock_frequency: Some(Hz(2000)),
        ..Default::default()
    });
    let handle = driver.handle();
    assert_eq!(handle.set_clock_rate(Hz(10_000)), Hz(2000));
    assert_eq!(handle.set_clock_rate(Hz(0)), Hz(1));
    assert_eq!(handle.clock_rate(), Hz(1));
}
