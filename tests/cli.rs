//! CLI argument parsing and end-to-end tests for the file-log commands.
//!
//! # Manual verification
//!
//! ```shell
//! quantum-persist publish --data-dir /tmp/persisted --client c1 \
//!   --topic sensors/t1 --packet-id 1 21.5
//! quantum-persist inspect --data-dir /tmp/persisted
//! quantum-persist simulate --messages 200 --drop-every 5
//! quantum-persist clear --data-dir /tmp/persisted --client c1
//! ```

use clap::Parser;
use quantum_persist::cli::commands::{run_clear, run_config, run_inspect, run_publish};
use quantum_persist::cli::{Cli, Commands, ConfigAction, QosLevel};
use quantum_persist::log::FileLog;
use std::path::{Path, PathBuf};
use tempfile::tempdir;

/// Helper to parse CLI args, returning the Commands enum.
fn parse_args(args: &[&str]) -> Result<Commands, clap::Error> {
    let mut full_args = vec!["quantum-persist"];
    full_args.extend(args);
    Cli::try_parse_from(full_args).map(|cli| cli.command)
}

#[test]
fn publish_defaults_to_qos1_without_retain() {
    let cmd = parse_args(&[
        "publish",
        "--client",
        "c1",
        "--topic",
        "sensors/t1",
        "--packet-id",
        "7",
        "21.5",
    ])
    .unwrap();

    if let Commands::Publish(args) = cmd {
        assert!(matches!(args.qos, QosLevel::Qos1));
        assert!(!args.retain);
        assert_eq!(args.packet_id, 7);
        assert_eq!(args.payload, "21.5");
        assert_eq!(args.location.data_dir, PathBuf::from("data/persisted"));
    } else {
        panic!("expected Publish command");
    }
}

#[test]
fn publish_rejects_out_of_range_packet_id() {
    let err = parse_args(&[
        "publish", "--client", "c1", "--topic", "t", "--packet-id", "70000", "x",
    ]);
    assert!(err.is_err());
}

#[test]
fn config_check_defers_path_to_environment() {
    let cmd = parse_args(&["config", "check"]).unwrap();
    match cmd {
        Commands::Config(args) => match args.action {
            ConfigAction::Check { config } => {
                assert_eq!(config, None);
            }
        },
        _ => panic!("expected Config command"),
    }
}

#[test]
fn simulate_accepts_global_log_level() {
    let cli = Cli::try_parse_from([
        "quantum-persist",
        "simulate",
        "--messages",
        "10",
        "--drop-every",
        "0",
        "--log-level",
        "debug",
    ])
    .unwrap();
    assert_eq!(cli.log_level.as_deref(), Some("debug"));
    match cli.command {
        Commands::Simulate(args) => {
            assert_eq!(args.messages, 10);
            assert_eq!(args.drop_every, 0);
            assert_eq!(args.pack_timeout_ms, None);
            assert!(args.config.is_none());
        }
        _ => panic!("expected Simulate command"),
    }
}

#[tokio::test]
async fn publish_inspect_and_clear_round_trip_on_disk() {
    let dir = tempdir().unwrap();
    let data_dir = dir.path().to_str().unwrap();
    for (id, payload) in [("1", "a"), ("2", "b")] {
        let Commands::Publish(args) = parse_args(&[
            "publish",
            "--data-dir",
            data_dir,
            "--client",
            "c1",
            "--topic",
            "sensors/t1",
            "--packet-id",
            id,
            "--retain",
            payload,
        ])
        .unwrap() else {
            panic!("expected Publish command");
        };
        run_publish(args).unwrap();
    }

    let log = FileLog::open(dir.path(), "mqtt_broker_application_client_", 10).unwrap();
    let topics = log.topics().unwrap();
    assert_eq!(topics.len(), 1);
    assert_eq!(topics[0].topic, "mqtt_broker_application_client_c1");
    assert_eq!(topics[0].records, 2);
    assert_eq!(topics[0].committed, None);

    let Commands::Inspect(args) = parse_args(&["inspect", "--data-dir", data_dir]).unwrap() else {
        panic!("expected Inspect command");
    };
    run_inspect(args).unwrap();

    let Commands::Clear(args) =
        parse_args(&["clear", "--data-dir", data_dir, "--client", "c1"]).unwrap()
    else {
        panic!("expected Clear command");
    };
    run_clear(args).await.unwrap();
    assert!(log.topics().unwrap().is_empty());
}

#[test]
fn config_check_accepts_explicit_path() {
    let Commands::Config(args) =
        parse_args(&["config", "check", "-c", "config/quantum-persist.toml"]).unwrap()
    else {
        panic!("expected Config command");
    };
    let ConfigAction::Check { config } = &args.action;
    assert_eq!(config.as_deref(), Some(Path::new("config/quantum-persist.toml")));
    run_config(args).unwrap();
}

#[test]
fn shipped_config_validates() {
    let cfg = quantum_persist::config::Config::load("config/quantum-persist.toml").unwrap();
    cfg.validate().unwrap();
    assert_eq!(cfg.log.backend, quantum_persist::config::LogBackend::File);
    assert_eq!(cfg.processing.pack_processing_timeout().as_secs(), 20);
}
