mod common;
use common::*;

fn long_silence_config() -> TowerConfig {
    TowerConfig::default().with_response_timeout(Duration::from_secs(120))
}

#[tokio::test(start_paused = true)]
async fn test_commands_written_one_at_a_time_in_order() {
    let (tower, sim, _events) = connected(SimOptions::quiet(), long_silence_config()).await;
    sim.set_echo_state(false);

    let first = tokio::spawn({
        let tower = tower.clone();
        async move { tower.set_led(LightLayer::TopRing, 0, LightEffect::On, false).await }
    });
    settle().await;
    let second = tokio::spawn({
        let tower = tower.clone();
        async move { tower.set_led(LightLayer::TopRing, 1, LightEffect::On, false).await }
    });
    settle().await;
    let third = tokio::spawn({
        let tower = tower.clone();
        async move { tower.play_sound(0x10, false, 1).await }
    });
    settle().await;

    assert_eq!(sim.written().len(), 1);
    assert_eq!(tower.queue_status().pending, 2);
    assert!(tower.queue_status().in_flight);

    for written in 2..=3 {
        sim.inject(state_report(&sim.tower_state()));
        settle().await;
        assert_eq!(sim.written().len(), written);
    }
    sim.inject(state_report(&sim.tower_state()));

    assert_eq!(first.await.unwrap(), Ok(CommandOutcome::Acknowledged));
    assert_eq!(second.await.unwrap(), Ok(CommandOutcome::Acknowledged));
    assert_eq!(third.await.unwrap(), Ok(CommandOutcome::Acknowledged));

    let written = sim.written();
    // second frame was composed on top of the first one
    assert_eq!(written[1][3], 0x22);
    assert_eq!(written[2][15], 0x10);
    assert_eq!(sim.write_attempts(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_command_times_out_successfully() {
    let (tower, sim, _events) = connected(SimOptions::quiet(), long_silence_config()).await;
    sim.set_echo_state(false);

    let start = Instant::now();
    let outcome = tower.set_led(LightLayer::Ledge, 2, LightEffect::Flicker, true).await;
    assert_eq!(outcome, Ok(CommandOutcome::TimedOut));
    assert_eq!(start.elapsed(), Duration::from_millis(30_000));
    assert!(tower.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_fails_outstanding_commands() {
    let (tower, sim, mut events) = connected(SimOptions::quiet(), long_silence_config()).await;
    sim.set_echo_state(false);

    let mut pending = Vec::new();
    for slot in 0..3 {
        let tower = tower.clone();
        pending.push(tokio::spawn(async move {
            tower.set_led(LightLayer::Base1, slot, LightEffect::On, false).await
        }));
        settle().await;
    }
    assert_eq!(tower.queue_status().pending, 2);

    tower.disconnect().await.unwrap();
    for handle in pending {
        assert_eq!(handle.await.unwrap(), Err(TowerError::QueueCleared));
    }
    assert_eq!(tower.queue_status().pending, 0);
    assert!(!tower.queue_status().in_flight);
    assert_eq!(disconnects(&drain(&mut events)), vec![DisconnectReason::Requested]);

    // nothing can be sent while disconnected
    assert_eq!(
        tower.reset_door().await,
        Err(TowerError::Link(LinkError::NotConnected))
    );
}

#[tokio::test(start_paused = true)]
async fn test_skull_drop_fires_once_per_new_count() {
    let (tower, sim, mut events) = connected(SimOptions::quiet(), long_silence_config()).await;
    assert_eq!(tower.skull_count(), None);

    let mut state = TowerState::default();
    state.beam.skull_count = 2;
    sim.inject(state_report(&state));
    settle().await;
    sim.inject(state_report(&state));
    settle().await;

    let drops: Vec<_> = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, TowerEvent::SkullDrop(_)))
        .collect();
    assert_eq!(drops, vec![TowerEvent::SkullDrop(2)]);
    assert_eq!(tower.skull_count(), Some(2));
}

#[tokio::test(start_paused = true)]
async fn test_skull_counter_reset() {
    let (tower, sim, mut events) = connected(SimOptions::quiet(), long_silence_config()).await;
    sim.drop_skull();
    settle().await;
    assert!(drain(&mut events).contains(&TowerEvent::SkullDrop(1)));

    assert_eq!(tower.reset_skull_counter().await, Ok(CommandOutcome::Acknowledged));
    assert_eq!(sim.written().last().map(|f| f.to_vec()), Some(vec![0x03]));
    assert_eq!(tower.skull_count(), Some(0));
    assert_eq!(sim.tower_state().beam.skull_count, 0);

    settle().await;
    assert!(!drain(&mut events).iter().any(|e| matches!(e, TowerEvent::SkullDrop(_))));
}

#[tokio::test(start_paused = true)]
async fn test_battery_notifications_respect_interval() {
    let (_tower, sim, mut events) = connected(SimOptions::quiet(), long_silence_config()).await;
    let battery_events = |events: Vec<TowerEvent>| {
        events
            .into_iter()
            .filter(|e| matches!(e, TowerEvent::Battery { .. }))
            .count()
    };

    sim.inject(battery_frame(4500));
    settle().await;
    sim.inject(battery_frame(3000));
    settle().await;
    let received = drain(&mut events);
    assert!(received.contains(&TowerEvent::Battery {
        millivolts: 4500,
        percent: 100
    }));
    assert_eq!(battery_events(received), 1);

    tokio::time::sleep(Duration::from_secs(15)).await;
    sim.inject(battery_frame(3000));
    settle().await;
    assert_eq!(battery_events(drain(&mut events)), 1);
}

#[tokio::test(start_paused = true)]
async fn test_battery_notifications_on_change_only() {
    let config = long_silence_config().with_battery_notify_on_change_only(true);
    let (tower, sim, mut events) = connected(SimOptions::quiet(), config).await;

    for millivolts in [4200, 4200, 4210, 3300] {
        sim.inject(battery_frame(millivolts));
        settle().await;
    }
    let batteries: Vec<_> = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, TowerEvent::Battery { .. }))
        .collect();
    assert_eq!(
        batteries,
        vec![
            TowerEvent::Battery {
                millivolts: 4200,
                percent: 95
            },
            TowerEvent::Battery {
                millivolts: 3300,
                percent: 30
            },
        ]
    );
    assert_eq!(tower.battery(), Some((3300, 30)));
}

#[tokio::test(start_paused = true)]
async fn test_transient_write_failures_are_retried_with_backoff() {
    let (tower, sim, _events) = connected(SimOptions::quiet(), long_silence_config()).await;
    sim.fail_next_writes(2, LinkError::WriteFailed("gatt busy".into()));

    let start = Instant::now();
    let outcome = tower.set_led(LightLayer::MiddleRing, 3, LightEffect::Breathe, false).await;
    assert_eq!(outcome, Ok(CommandOutcome::Acknowledged));
    assert_eq!(sim.write_attempts(), 3);
    assert_eq!(sim.written().len(), 1);
    // 250ms then 500ms
    assert_eq!(start.elapsed(), Duration::from_millis(750));
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_give_up_silently() {
    let config = long_silence_config()
        .with_max_send_retries(2)
        .with_command_timeout(Duration::from_secs(5));
    let (tower, sim, mut events) = connected(SimOptions::quiet(), config).await;
    sim.fail_next_writes(10, LinkError::Timeout);

    let outcome = tower.play_sound(3, false, 2).await;
    assert_eq!(outcome, Ok(CommandOutcome::TimedOut));
    assert_eq!(sim.write_attempts(), 3);
    assert!(tower.is_connected());
    assert!(disconnects(&drain(&mut events)).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_link_down_write_disconnects_without_retry() {
    let (tower, sim, mut events) = connected(SimOptions::quiet(), long_silence_config()).await;
    sim.set_link_connected(false);

    let outcome = tower.unjam_drums().await;
    assert_eq!(outcome, Err(TowerError::QueueCleared));
    assert_eq!(sim.write_attempts(), 1);
    assert!(!tower.is_connected());
    assert_eq!(
        disconnects(&drain(&mut events)),
        vec![DisconnectReason::WriteFailed(LinkError::NotConnected)]
    );
}

#[tokio::test(start_paused = true)]
async fn test_connect_failure_becomes_disconnect_event() {
    let sim = SimulatedTower::new(SimOptions::quiet());
    sim.fail_next_connect(LinkError::NotFound);
    let tower = DarkTower::new(sim.clone(), long_silence_config());
    let mut events = tower.subscribe();

    assert_eq!(tower.connect().await, Ok(()));
    assert!(!tower.is_connected());
    assert_eq!(
        disconnects(&drain(&mut events)),
        vec![DisconnectReason::ConnectFailed(LinkError::NotFound)]
    );

    tower.connect().await.unwrap();
    assert!(tower.is_connected());
    let info = tower.device_info().expect("device info is cached on connect");
    assert_eq!(info.get("firmware").map(String::as_str), Some("sim"));
}

#[tokio::test(start_paused = true)]
async fn test_connect_after_dispose_fails() {
    let (tower, sim, mut events) = connected(SimOptions::default(), TowerConfig::default()).await;
    tower.dispose().await;

    assert_eq!(tower.connect().await, Err(TowerError::Disposed));
    assert_eq!(tower.calibrate().await, Err(TowerError::Disposed));
    assert!(sim.is_cleaned_up());
    assert!(
        disconnects(&drain(&mut events)).contains(&DisconnectReason::Disposed),
        "dispose of a live connection is reported"
    );

    // disposing twice is harmless
    tower.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn test_calibration_completes_once() {
    let (tower, _sim, mut events) = connected(SimOptions::default(), TowerConfig::default()).await;
    assert!(!tower.is_calibrated());

    let outcome = tower.calibrate().await;
    assert_eq!(outcome, Ok(CommandOutcome::Acknowledged));
    settle().await;

    let received = drain(&mut events);
    let completions = received
        .iter()
        .filter(|e| **e == TowerEvent::CalibrationComplete)
        .count();
    assert_eq!(completions, 1);
    assert!(tower.is_calibrated());
    let status = tower.connection_status();
    assert!(!status.calibrating);
    assert!(!status.long_operation);
}

#[tokio::test(start_paused = true)]
async fn test_break_seal_plays_sound_without_retaining_it() {
    let (tower, sim, _events) = connected(SimOptions::quiet(), long_silence_config()).await;
    let seal = Seal::new(DrumLevel::Middle, Compass::South);

    assert_eq!(tower.break_seal(seal).await, Ok(CommandOutcome::Acknowledged));
    let frame = sim.written().pop().unwrap();
    // middle ring is layer 1; south is its third slot, the high bits of the layer's second byte
    assert_eq!(frame[6], 0b0110_0000);
    assert_eq!(frame[15], tower.config().seal_break_sound);

    assert!(tower.is_seal_broken(seal));
    assert_eq!(tower.broken_seals(), vec![seal]);
    tower.reset_broken_seals();
    assert!(!tower.is_seal_broken(seal));
}

#[tokio::test(start_paused = true)]
async fn test_acknowledged_rotation_clears_long_operation() {
    let (tower, sim, _events) = connected(SimOptions::quiet(), long_silence_config()).await;

    let outcome = tower.rotate_drum(DrumLevel::Top, Compass::East, true).await;
    assert_eq!(outcome, Ok(CommandOutcome::Acknowledged));
    assert_eq!(sim.tower_state().drum(DrumLevel::Top).position, Compass::East);
    assert!(!tower.connection_status().long_operation);
    assert!(tower.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_rotation_flag_cleared_by_grace() {
    let config = long_silence_config().with_command_timeout(Duration::from_secs(60));
    let (tower, sim, _events) = connected(SimOptions::quiet(), config).await;
    sim.set_echo_state(false);

    let rotation = tokio::spawn({
        let tower = tower.clone();
        async move { tower.rotate_drum(DrumLevel::Middle, Compass::South, false).await }
    });
    settle().await;
    assert!(tower.connection_status().long_operation);

    tokio::time::sleep(Duration::from_secs(29)).await;
    assert!(tower.connection_status().long_operation);
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert!(!tower.connection_status().long_operation);
    assert_eq!(tower.queue_status().current.as_deref(), Some("rotate drum"));
    assert!(tower.is_connected());

    sim.inject(state_report(&sim.tower_state()));
    assert_eq!(rotation.await.unwrap(), Ok(CommandOutcome::Acknowledged));
}

#[tokio::test(start_paused = true)]
async fn test_queued_rotation_flags_long_operation_when_written() {
    let (tower, sim, mut events) = connected(SimOptions::quiet(), long_silence_config()).await;
    sim.set_echo_state(false);

    let led = tokio::spawn({
        let tower = tower.clone();
        async move { tower.set_led(LightLayer::TopRing, 0, LightEffect::On, false).await }
    });
    settle().await;
    let rotation = tokio::spawn({
        let tower = tower.clone();
        async move { tower.rotate_drum(DrumLevel::Bottom, Compass::West, false).await }
    });
    settle().await;
    assert_eq!(tower.queue_status().pending, 1);
    assert!(!tower.connection_status().long_operation);

    // the LED command times out and the rotation goes out behind it
    tokio::time::sleep(Duration::from_millis(30_100)).await;
    assert_eq!(led.await.unwrap(), Ok(CommandOutcome::TimedOut));
    assert_eq!(sim.written().len(), 2);
    assert_eq!(tower.queue_status().current.as_deref(), Some("rotate drum"));
    assert!(tower.connection_status().long_operation);

    sim.inject(state_report(&sim.tower_state()));
    assert_eq!(rotation.await.unwrap(), Ok(CommandOutcome::Acknowledged));
    assert!(!tower.connection_status().long_operation);
    assert!(tower.is_connected());
    assert!(disconnects(&drain(&mut events)).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_calibration_past_grace_does_not_complete_late() {
    let options = SimOptions {
        calibration_time: Duration::from_secs(40),
        ..SimOptions::quiet()
    };
    let (tower, _sim, mut events) = connected(options, long_silence_config()).await;

    let calibration = tokio::spawn({
        let tower = tower.clone();
        async move { tower.calibrate().await }
    });
    settle().await;
    assert!(tower.connection_status().calibrating);

    tokio::time::sleep(Duration::from_millis(30_100)).await;
    assert_eq!(calibration.await.unwrap(), Ok(CommandOutcome::TimedOut));
    let status = tower.connection_status();
    assert!(!status.calibrating);
    assert!(!status.long_operation);

    // the tower finishes well after the window closed
    tokio::time::sleep(Duration::from_secs(10)).await;
    settle().await;
    assert!(tower.is_calibrated());
    assert!(!drain(&mut events).contains(&TowerEvent::CalibrationComplete));
}

#[tokio::test(start_paused = true)]
async fn test_random_rotate_touches_only_selected_drums() {
    let (tower, sim, _events) = connected(SimOptions::quiet(), long_silence_config()).await;
    tower.rotate(Compass::West, Compass::West, Compass::West, false).await.unwrap();

    tower.random_rotate(&[DrumLevel::Bottom]).await.unwrap();
    let state = sim.tower_state();
    assert_eq!(state.drum(DrumLevel::Top).position, Compass::West);
    assert_eq!(state.drum(DrumLevel::Middle).position, Compass::West);
    assert_eq!(sim.written().len(), 2);

    // no drums selected, nothing sent
    tower.random_rotate(&[]).await.unwrap();
    assert_eq!(sim.written().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_unmapped_frames_are_forwarded() {
    let (_tower, sim, mut events) = connected(SimOptions::quiet(), long_silence_config()).await;
    sim.inject(Bytes::from_static(&[0x5a, 0x01]));
    settle().await;

    let received = drain(&mut events);
    assert!(received.iter().any(|e| matches!(
        e,
        TowerEvent::Message { kind, lines } if kind.is_unmapped() && lines[1] == "5a01"
    )));
}

#[tokio::test(start_paused = true)]
async fn test_mirror_tracks_queued_state() {
    let (tower, sim, _events) = connected(SimOptions::quiet(), long_silence_config()).await;
    sim.set_echo_state(false);

    let pending = tokio::spawn({
        let tower = tower.clone();
        async move { tower.set_led(LightLayer::Base2, 0, LightEffect::BreatheHalf, true).await }
    });
    settle().await;

    // the mirror changes as soon as the command is queued
    let light = tower.state().unwrap().layers[LightLayer::Base2.index()].lights[0];
    assert_eq!(light.effect, LightEffect::BreatheHalf);
    assert!(light.looped);

    sim.inject(state_report(&sim.tower_state()));
    assert_eq!(pending.await.unwrap(), Ok(CommandOutcome::Acknowledged));
}
