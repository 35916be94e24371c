//! `Config::parse` reading a real TOML file from disk, the same fallback
//! path a deployed relay hits when it's handed `--config path`.

use std::io::Write;

use relay::config::Config;

#[test]
fn parse_reads_overridden_fields_and_falls_back_for_the_rest() {
    let mut file = tempfile::NamedTempFile::new().expect("create temp config file");
    write!(
        file,
        r#"
        [rtmp]
        listen = "0.0.0.0:19350"

        [webrtc]
        udp_mux_port = 17000

        [queue]
        capacity = 128
        "#
    )
    .unwrap();

    let cfg = Config::parse(Some(file.path().to_str().unwrap())).expect("parse temp config");

    assert_eq!(cfg.rtmp.listen.port(), 19350);
    assert_eq!(cfg.webrtc.udp_mux_port, 17000);
    assert_eq!(cfg.queue.capacity, 128);
    // Untouched sections still get their spec defaults.
    assert_eq!(cfg.rtsp.listen.port(), 554);
    assert!(cfg.http.cors);
}

#[test]
fn parse_of_a_missing_explicit_path_falls_back_to_defaults() {
    let cfg = Config::parse(Some("/nonexistent/path/to/relay.toml")).expect("falls back, not an error");
    assert_eq!(cfg.rtmp.listen.port(), 1935);
}
