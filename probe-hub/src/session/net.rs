//! Client presence sampling via the kernel socket tables.
//!
//! The supervisor decides attach/detach from the number of established TCP
//! connections on a session's primary port. The host tables are the main
//! source; the server process's own view (`/proc/<pid>/net/tcp`) is read as
//! well and the larger count wins, which covers servers running in a
//! different network namespace.

use std::path::Path;

const TCP_ESTABLISHED: &str = "01";

/// Counts established connections with the given local port in one
/// `/proc/net/tcp`-format table.
pub fn established_in_table(table: &str, port: u16) -> usize {
    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let local = fields.nth(1)?;
            let state = fields.nth(1)?;
            let local_port = u16::from_str_radix(local.rsplit(':').next()?, 16).ok()?;
            (local_port == port && state == TCP_ESTABLISHED).then_some(())
        })
        .count()
}

fn count_in(base: &Path, port: u16) -> usize {
    ["tcp", "tcp6"]
        .iter()
        .map(|name| {
            std::fs::read_to_string(base.join("net").join(name))
                .map(|table| established_in_table(&table, port))
                .unwrap_or(0)
        })
        .sum()
}

/// Established client connections on `port`, as seen by the host and by the
/// server process itself.
pub fn count_established(port: u16, server_pid: Option<u32>) -> usize {
    let host = count_in(Path::new("/proc"), port);
    let from_pid = server_pid
        .map(|pid| count_in(&Path::new("/proc").join(pid.to_string()), port))
        .unwrap_or(0);
    host.max(from_pid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    // 0x0D03 = 3331, 0x22B3 = 8883.
    const SAMPLE: &str = "\
  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 0100007F:0D03 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 31337 1 0000000000000000 100 0 0 10 0
   1: 0100007F:0D03 0100007F:A2C4 01 00000000:00000000 00:00000000 00000000  1000        0 31338 1 0000000000000000 20 4 30 10 -1
   2: 0100007F:0D03 0100007F:A2C6 01 00000000:00000000 00:00000000 00000000  1000        0 31339 1 0000000000000000 20 4 30 10 -1
   3: 0100007F:22B3 0100007F:A2C8 06 00000000:00000000 00:00000000 00000000  1000        0 31340 1 0000000000000000 20 4 30 10 -1
";

    #[test]
    fn counts_only_established_on_the_port() {
        // The listener (state 0A) and the TIME_WAIT entry (06) don't count.
        assert_eq!(established_in_table(SAMPLE, 3331), 2);
        assert_eq!(established_in_table(SAMPLE, 8883), 0);
        assert_eq!(established_in_table(SAMPLE, 4441), 0);
    }

    #[test]
    fn tolerates_garbage_lines() {
        let table = "header\nnot a socket line\n   1: zzzz:GGGG 0:0 01\n";
        assert_eq!(established_in_table(table, 3331), 0);
    }

    #[test]
    fn empty_table_is_zero() {
        assert_eq!(established_in_table("", 3331), 0);
    }
}
