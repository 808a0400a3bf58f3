//! Port probing

use std::net::TcpListener;
use std::process::Command;

use tracing::debug;

/// Answers "is anything using this TCP port?"
pub trait PortProbe: Send + Sync {
    fn is_in_use(&self, port: u16) -> bool;
}

/// Probe backed by `netstat`, with a bind attempt as a second opinion
#[derive(Debug, Default, Clone, Copy)]
pub struct NetstatProbe;

impl NetstatProbe {
    fn netstat_output() -> Option<String> {
        let mut cmd = Command::new("netstat");
        if cfg!(windows) {
            cmd.arg("-an");
        } else {
            cmd.arg("-antu");
        }
        match cmd.output() {
            Ok(output) => Some(String::from_utf8_lossy(&output.stdout).into_owned()),
            Err(e) => {
                debug!("netstat unavailable: {}", e);
                None
            }
        }
    }
}

impl PortProbe for NetstatProbe {
    fn is_in_use(&self, port: u16) -> bool {
        if let Some(output) = Self::netstat_output() {
            if netstat_reports_port(&output, port) {
                return true;
            }
        }
        TcpListener::bind(("127.0.0.1", port)).is_err()
    }
}

/// Whether any row of `netstat` output has `port` as its local port.
///
/// `TIME_WAIT` rows are ignored: the socket is closing and the port is reusable.
pub fn netstat_reports_port(output: &str, port: u16) -> bool {
    output.lines().any(|line| {
        let columns: Vec<&str> = line.split_whitespace().collect();
        let Some(proto) = columns.first() else {
            return false;
        };
        let proto = proto.to_ascii_lowercase();
        if !(proto.starts_with("tcp") || proto.starts_with("udp")) {
            return false;
        }
        if columns.iter().any(|c| c.eq_ignore_ascii_case("TIME_WAIT")) {
            return false;
        }
        // unix: Proto Recv-Q Send-Q Local Foreign [State]; windows: Proto Local Foreign [State]
        let local = if columns.len() >= 5 && columns[1].parse::<u64>().is_ok() {
            columns[3]
        } else {
            match columns.get(1) {
                Some(local) => *local,
                None => return false,
            }
        };
        local_port(local) == Some(port)
    })
}

/// Port of `127.0.0.1:80`, `[::]:80`, `*.80` (BSD) and friends
fn local_port(address: &str) -> Option<u16> {
    let (_, port) = address.rsplit_once([':', '.'])?;
    port.parse().ok()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::BTreeSet;

    /// Probe that reports a fixed set of ports as busy
    #[derive(Debug, Default)]
    pub(crate) struct FakeProbe(pub BTreeSet<u16>);

    impl FakeProbe {
        pub(crate) fn busy(ports: &[u16]) -> Self {
            Self(ports.iter().copied().collect())
        }
    }

    impl PortProbe for FakeProbe {
        fn is_in_use(&self, port: u16) -> bool {
            self.0.contains(&port)
        }
    }

    const LINUX: &str = "\
Active Internet connections (servers and established)
Proto Recv-Q Send-Q Local Address           Foreign Address         State
tcp        0      0 127.0.0.1:18332         0.0.0.0:*               LISTEN
tcp        0      0 127.0.0.1:51001         127.0.0.1:40022         TIME_WAIT
tcp6       0      0 :::56565                :::*                    LISTEN
udp        0      0 0.0.0.0:5353            0.0.0.0:*
";

    const WINDOWS: &str = "
Active Connections

  Proto  Local Address          Foreign Address        State
  TCP    0.0.0.0:9999           0.0.0.0:0              LISTENING
  TCP    127.0.0.1:18342        127.0.0.1:50123        TIME_WAIT
  TCP    [::]:47124             [::]:0                 LISTENING
";

    const MACOS: &str = "
Active Internet connections (including servers)
Proto Recv-Q Send-Q  Local Address          Foreign Address        (state)
tcp4       0      0  127.0.0.1.18444        *.*                    LISTEN
";

    #[test]
    fn test_linux_rows() {
        assert!(netstat_reports_port(LINUX, 18332));
        assert!(netstat_reports_port(LINUX, 56565));
        assert!(netstat_reports_port(LINUX, 5353));
        assert!(!netstat_reports_port(LINUX, 51001));
        assert!(!netstat_reports_port(LINUX, 0));
    }

    #[test]
    fn test_windows_time_wait_is_free() {
        assert!(netstat_reports_port(WINDOWS, 9999));
        assert!(netstat_reports_port(WINDOWS, 47124));
        assert!(!netstat_reports_port(WINDOWS, 18342));
    }

    #[test]
    fn test_bsd_dotted_ports() {
        assert!(netstat_reports_port(MACOS, 18444));
        assert!(!netstat_reports_port(MACOS, 18332));
    }

    #[test]
    fn test_bound_listener_is_in_use() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(NetstatProbe.is_in_use(port));
    }
}
