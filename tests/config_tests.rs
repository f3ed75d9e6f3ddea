use std::io::Write;

use clap::Parser;
use pixelpilot_mini::cli::Args;
use pixelpilot_mini::Config;

#[test]
fn toml_file_overrides_defaults() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(
        file,
        r#"
[display]
connector = "HDMI-A-2"
blank_primary = false

[pipeline]
latency_ms = 20
aud_dev = "hw:1,0"
cpu_list = [2, 3]

[osd]
enable = true
refresh_ms = 250
"#
    )
    .unwrap();

    let cfg = Config::load(Some(file.path())).unwrap();
    assert_eq!(cfg.connector(), Some("HDMI-A-2"));
    assert!(!cfg.display.blank_primary);
    assert_eq!(cfg.pipeline.latency_ms, 20);
    assert_eq!(cfg.pipeline.aud_dev, "hw:1,0");
    assert_eq!(cfg.pipeline.cpu_list, vec![2, 3]);
    assert!(cfg.osd.enable);
    assert_eq!(cfg.osd.refresh_ms, 250);
    // untouched sections keep their defaults
    assert_eq!(cfg.pipeline.vid_pt, 97);
    assert_eq!(cfg.idr.path, "/request/idr");
}

#[test]
fn missing_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(Config::load(Some(&dir.path().join("absent.toml"))).is_err());
}

#[test]
fn cli_wins_and_guardrails_clamp() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(file, "[osd]\nrefresh_ms = 250\n[pipeline]\nrestart_limit = 5").unwrap();
    let path = file.path().to_str().unwrap().to_string();

    let args = Args::try_parse_from([
        "pixelpilot_mini_rk",
        "--config",
        &path,
        "--osd-refresh-ms",
        "4",
        "--no-audio",
    ])
    .unwrap();
    let cfg = args.resolve().unwrap();
    assert_eq!(cfg.osd.refresh_ms, pixelpilot_mini::MIN_OSD_REFRESH_MS);
    assert_eq!(cfg.pipeline.restart_limit, 5);
    assert!(cfg.pipeline.no_audio);
}

#[test]
fn environment_overrides_file() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(file, "[idr]\nhttp_port = 8080").unwrap();
    std::env::set_var("PIXELPILOT_IDR__HTTP_PORT", "9090");
    let cfg = Config::load(Some(file.path()));
    std::env::remove_var("PIXELPILOT_IDR__HTTP_PORT");
    assert_eq!(cfg.unwrap().idr.http_port, 9090);
}
