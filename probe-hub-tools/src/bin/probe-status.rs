#[cfg(unix)]
use std::os::unix::process::CommandExt;
use std::process::{exit, Command};

fn main() {
    // `probe-status` is a small shim around `probe-hub status`.
    let args: Vec<_> = std::env::args_os().skip(1).collect();

    let mut cmd = Command::new("probe-hub");
    cmd.arg("status");
    cmd.args(&args);

    #[cfg(unix)]
    let err = cmd.exec();
    #[cfg(not(unix))]
    let err = match cmd.spawn() {
        Ok(mut child) => match child.wait() {
            Ok(exitcode) => exit(exitcode.code().unwrap_or(98)),
            Err(e) => e,
        },
        Err(e) => e,
    };

    eprintln!("Error launching `probe-hub`: {}", err);
    eprintln!("Note: the `probe-status` binary is a small shim that launches `probe-hub`.");
    eprintln!("Make sure `probe-hub` is installed and available in $PATH.");

    exit(99);
}
