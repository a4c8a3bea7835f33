use assert_cmd::prelude::*;
use predicates::str::contains;
use std::process::Command;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_version() {
        Command::cargo_bin("replichat")
            .unwrap()
            .args(&["-V"])
            .assert()
            .stdout(contains(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn missing_port_is_fatal() {
        Command::cargo_bin("replichat")
            .unwrap()
            .assert()
            .failure()
            .stderr(contains("--port"));
    }

    #[test]
    fn bad_log_level_is_fatal() {
        Command::cargo_bin("replichat")
            .unwrap()
            .args(&["--port", "50051", "--log-level", "noisy"])
            .assert()
            .failure();
    }
}
