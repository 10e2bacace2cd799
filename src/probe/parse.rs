//! Parsers for the text emitted by `ss`, `netstat`, `lsof`, `ps`, `wmic` and `hostname -I`.

use std::net::IpAddr;

use once_cell::sync::Lazy;
use regex::Regex;

use super::ProcessInfo;

static SS_PID: Lazy<Regex> = Lazy::new(|| Regex::new(r"pid=(\d+)").expect("valid ss pid regex"));
static NETSTAT_PID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|\s)(\d+)/\S*").expect("valid netstat pid regex"));

/// Rows whose local address (first `host:port` column) is bound to `port`.
pub(crate) fn listening_rows(output: &str, port: u16) -> Vec<&str> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| local_port(line) == Some(port))
        .collect()
}

fn local_port(row: &str) -> Option<u16> {
    let address = row.split_whitespace().find(|token| token.contains(':'))?;
    let (_, port) = address.rsplit_once(':')?;
    port.parse().ok()
}

/// Owning pids on one listing row: `ss -p` (`pid=N`), `netstat -p` (`N/name`)
/// or Windows `netstat -ano` (trailing pid column).
pub(crate) fn row_pids(row: &str) -> Vec<u32> {
    let mut pids: Vec<u32> = SS_PID
        .captures_iter(row)
        .filter_map(|captures| captures[1].parse().ok())
        .collect();

    if pids.is_empty() {
        pids = NETSTAT_PID
            .captures_iter(row)
            .filter_map(|captures| captures[1].parse().ok())
            .collect();
    }

    if pids.is_empty() {
        let tokens: Vec<&str> = row.split_whitespace().collect();
        let windows_row = tokens.len() >= 4
            && (tokens[0].eq_ignore_ascii_case("tcp") || tokens[0].eq_ignore_ascii_case("udp"));
        if windows_row {
            pids.extend(tokens.last().and_then(|last| last.parse::<u32>().ok()));
        }
    }

    pids.retain(|pid| *pid != 0);
    pids
}

pub(crate) fn collect_pids<'a>(rows: impl IntoIterator<Item = &'a str>) -> Vec<u32> {
    let mut pids = Vec::new();
    for row in rows {
        for pid in row_pids(row) {
            if !pids.contains(&pid) {
                pids.push(pid);
            }
        }
    }
    pids
}

/// Whitespace separated pids, as printed by `lsof -t`.
pub(crate) fn pid_list(output: &str) -> Vec<u32> {
    let mut pids = Vec::new();
    for pid in output
        .split_whitespace()
        .filter_map(|token| token.parse::<u32>().ok())
    {
        if pid != 0 && !pids.contains(&pid) {
            pids.push(pid);
        }
    }
    pids
}

/// `<pid> <command line>` rows, as printed by `ps -eo pid=,args=` or `pgrep -af`.
pub(crate) fn process_listing(output: &str) -> Vec<ProcessInfo> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let (pid, command) = line.split_once(char::is_whitespace)?;
            Some(ProcessInfo {
                pid: pid.parse().ok()?,
                command: command.trim().to_string(),
            })
        })
        .collect()
}

/// `wmic process get ProcessId,CommandLine /format:csv` output: `Node,CommandLine,ProcessId`.
pub(crate) fn wmic_csv(output: &str) -> Vec<ProcessInfo> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let (rest, pid) = line.rsplit_once(',')?;
            let pid = pid.trim().parse().ok()?;
            let (_, command) = rest.split_once(',')?;
            Some(ProcessInfo {
                pid,
                command: command.trim().to_string(),
            })
        })
        .filter(|info| !info.command.is_empty())
        .collect()
}

/// First routable IPv4 address from `hostname -I`, else the first parseable address.
pub(crate) fn pick_guest_address(output: &str) -> Option<IpAddr> {
    let addresses: Vec<IpAddr> = output
        .split_whitespace()
        .filter_map(|token| token.parse().ok())
        .collect();

    addresses
        .iter()
        .copied()
        .find(|address| match address {
            IpAddr::V4(v4) => !v4.is_loopback() && !v4.is_link_local() && !v4.is_unspecified(),
            IpAddr::V6(_) => false,
        })
        .or_else(|| addresses.first().copied())
}

/// Distribution names from `wsl -l -q`, which writes UTF-16 that reaches us
/// with a NUL after every character.
pub(crate) fn distro_list(output: &str) -> Vec<String> {
    output
        .replace('\0', "")
        .lines()
        .map(|line| line.trim_start_matches('\u{feff}').trim())
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

pub(crate) fn matches_signature(command: &str, signature: &str) -> bool {
    let signature = signature.trim();
    !signature.is_empty() && command.to_lowercase().contains(&signature.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn windows_netstat_rows_match_local_port_only() {
        let output = "\
  Proto  Local Address          Foreign Address        State           PID
  TCP    0.0.0.0:8188           0.0.0.0:0              LISTENING       4312
  TCP    127.0.0.1:51234        127.0.0.1:8188         ESTABLISHED     9001
  TCP    [::]:8188              [::]:0                 LISTENING       4312
  TCP    0.0.0.0:18188          0.0.0.0:0              LISTENING       77
";
        let rows = listening_rows(output, 8188);
        assert_eq!(rows.len(), 2);
        assert_eq!(collect_pids(rows), vec![4312]);
    }

    #[test]
    fn linux_listings_yield_pids() {
        let ss = r#"LISTEN 0 4096 0.0.0.0:5000 0.0.0.0:* users:(("python3",pid=812,fd=3),("python3",pid=813,fd=3))"#;
        assert_eq!(collect_pids(listening_rows(ss, 5000)), vec![812, 813]);

        let netstat = "\
Active Internet connections (only servers)
Proto Recv-Q Send-Q Local Address           Foreign Address         State       PID/Program name
tcp        0      0 0.0.0.0:5000            0.0.0.0:*               LISTEN      1207/python3
tcp6       0      0 :::22                   :::*                    LISTEN      -
";
        let rows = listening_rows(netstat, 5000);
        assert_eq!(rows.len(), 1);
        assert_eq!(collect_pids(rows), vec![1207]);
    }

    #[test]
    fn rows_without_pid_information_are_still_reported() {
        let ss = "LISTEN 0 128 127.0.0.1:5000 0.0.0.0:*";
        let rows = listening_rows(ss, 5000);
        assert_eq!(rows.len(), 1);
        assert!(collect_pids(rows).is_empty());
    }

    #[test]
    fn parses_process_listings() {
        let ps = "  1 /sbin/init\n 4021 /bin/bash /opt/app/start.sh --port 5000\n";
        let processes = process_listing(ps);
        assert_eq!(processes.len(), 2);
        assert_eq!(processes[1].pid, 4021);
        assert_eq!(processes[1].command, "/bin/bash /opt/app/start.sh --port 5000");

        let csv = "\r\nNode,CommandLine,ProcessId\r\nBOX,cmd.exe /c F:\\media\\comfyui-start.bat,  512\r\nBOX,,4\r\n";
        let processes = wmic_csv(csv);
        assert_eq!(processes.len(), 1);
        assert_eq!(processes[0].pid, 512);
        assert!(matches_signature(&processes[0].command, "COMFYUI-START.BAT"));
    }

    #[test]
    fn guest_address_prefers_routable_ipv4() {
        let output = "fe80::1 127.0.0.1 172.24.9.3 10.0.0.2\n";
        assert_eq!(pick_guest_address(output), "172.24.9.3".parse().ok());
        assert_eq!(pick_guest_address("fd00::5\n"), "fd00::5".parse().ok());
        assert_eq!(pick_guest_address("\n"), None);
    }

    #[test]
    fn distro_names_survive_wide_output() {
        let wide: String = "\u{feff}Ubuntu\r\ndocker-desktop\r\n\r\n"
            .chars()
            .flat_map(|ch| [ch, '\0'])
            .collect();
        assert_eq!(distro_list(&wide), vec!["Ubuntu", "docker-desktop"]);
        assert_eq!(distro_list("Debian\n"), vec!["Debian"]);
        assert!(distro_list("").is_empty());
    }
}
