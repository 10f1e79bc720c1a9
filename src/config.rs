//! Daemon configuration.
//!
//! Settings come from a line-oriented `key = value` file (`#` and `!`
//! start comments) and from the command line; command-line values win.
//! Unknown keys and malformed values are logged and skipped; a bad line
//! never stops the daemon from starting.

use std::io;
use std::io::BufRead;
use std::path::Path;
use std::time::Duration;

use log::debug;
use log::error;

/// Default location of the config file.
pub const DEFAULT_CONFIG_FILE: &str = "/etc/falter.conf";

/// Default RPC program number and version.
pub const PROGRAM: u32 = 391_002;
pub const VERSION: u32 = 2;

const CFG_UNTRUSTED_USER: &str = "untrusted_user";
const CFG_LOCAL_ONLY: &str = "local_only";
const CFG_XTAB_VERIFICATION: &str = "xtab_verification";
const CFG_IDLE_TIMEOUT: &str = "idle_timeout";
const CFG_POLLING_INTERVAL: &str = "nfs_polling_interval";
const CFG_INSECURE_COMPAT: &str = "insecure_compatibility";
const CFG_DISABLE_AUDIT: &str = "disable_audit";
const CFG_DISABLE_MAC: &str = "disable_mac";

/// Merged configuration the daemon runs with.
#[derive(Clone, Debug)]
pub struct Config {
    /// Fallback credential for unauthenticated clients.
    pub untrusted_user: Option<String>,
    /// Refuse connections from off-host.
    pub local_only: bool,
    /// Check the export table before honouring remote requests (hook).
    pub xtab_verification: bool,
    /// Trust the uid/gid carried in request payloads.
    pub insecure_compat: bool,
    /// Exit this long after the last client disconnects; zero disables.
    pub idle_timeout: Duration,
    /// Polling wheel period.
    pub poll_interval: Duration,
    /// Poll remote hosts whose peer daemon is unreachable.
    pub remote_polling: bool,
    /// RPC program/version registered with the portmapper.
    pub program: u32,
    pub version: u32,
    /// Collaborator hooks; parsed, logged, otherwise inert here.
    pub disable_audit: bool,
    pub disable_mac: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            untrusted_user: None,
            local_only: false,
            xtab_verification: true,
            insecure_compat: false,
            idle_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_secs(6),
            remote_polling: true,
            program: PROGRAM,
            version: VERSION,
            disable_audit: false,
            disable_mac: false,
        }
    }
}

impl Config {
    /// Read a config file, applying recognised keys over `self`.
    pub fn load_file(&mut self, path: &Path) -> io::Result<()> {
        let file = std::fs::File::open(path)?;
        self.load(io::BufReader::new(file), &path.display().to_string());
        Ok(())
    }

    fn load<R: BufRead>(&mut self, reader: R, origin: &str) {
        for (lineno, line) in reader.lines().enumerate() {
            let lineno = lineno + 1;
            let line = match line {
                Ok(line) => line,
                Err(err) => {
                    error!("{} line {}: read error: {}", origin, lineno, err);
                    return;
                }
            };
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                error!(
                    "{} line {} has no \"=\" and is being ignored",
                    origin, lineno
                );
                continue;
            };
            let key = key.trim();
            let value = value.trim();
            debug!("read {} line {}: \"{}\" = \"{}\"", origin, lineno, key, value);
            self.apply(key, value, origin, lineno);
        }
    }

    fn apply(&mut self, key: &str, value: &str, origin: &str, lineno: usize) {
        match key {
            CFG_UNTRUSTED_USER => {
                if self.untrusted_user.is_none() {
                    self.untrusted_user = Some(value.to_owned());
                } else {
                    error!("{} line {}: ignoring duplicate {}", origin, lineno, key);
                }
            }
            CFG_LOCAL_ONLY => self.local_only = is_true(value),
            CFG_XTAB_VERIFICATION => {
                self.xtab_verification = is_true(value);
                if self.xtab_verification && self.insecure_compat {
                    self.xtab_verification = false;
                    error!(
                        "{} line {}: ignoring {} because {} is set",
                        origin, lineno, key, CFG_INSECURE_COMPAT
                    );
                }
            }
            CFG_IDLE_TIMEOUT => match value.parse::<u64>() {
                Ok(secs) => self.idle_timeout = Duration::from_secs(secs),
                Err(_) => bad_value(origin, lineno, key),
            },
            CFG_POLLING_INTERVAL => match value.parse::<u64>() {
                Ok(secs) if secs > 0 => self.poll_interval = Duration::from_secs(secs),
                _ => bad_value(origin, lineno, key),
            },
            CFG_INSECURE_COMPAT => self.insecure_compat = is_true(value),
            CFG_DISABLE_AUDIT => self.disable_audit = is_true(value),
            CFG_DISABLE_MAC => self.disable_mac = is_true(value),
            _ => error!(
                "{} line {}: unrecognized key \"{}\" is being ignored",
                origin, lineno, key
            ),
        }
    }
}

fn bad_value(origin: &str, lineno: usize, key: &str) {
    error!(
        "{} line {}: ignoring invalid value for {}",
        origin, lineno, key
    );
}

fn is_true(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "true" | "yes" | "on" | "1"
    )
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    fn parse(text: &str) -> Config {
        let mut config = Config::default();
        config.load(Cursor::new(text), "test.conf");
        config
    }

    #[test]
    fn recognised_keys_apply() {
        let config = parse(
            "# leading comment\n\
             untrusted_user = nobody\n\
             local_only = yes\n\
             idle_timeout = 30\n\
             nfs_polling_interval = 2\n\
             insecure_compatibility = false\n",
        );
        assert_eq!(config.untrusted_user.as_deref(), Some("nobody"));
        assert!(config.local_only);
        assert_eq!(config.idle_timeout, Duration::from_secs(30));
        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert!(!config.insecure_compat);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let config = parse(
            "! bang comment\n\
             no equals sign here\n\
             nfs_polling_interval = 0\n\
             idle_timeout = soon\n\
             untrusted_user = nobody\n\
             untrusted_user = somebody\n",
        );
        // Bad values keep the defaults; the duplicate user is ignored.
        assert_eq!(config.poll_interval, Duration::from_secs(6));
        assert_eq!(config.idle_timeout, Duration::from_secs(5));
        assert_eq!(config.untrusted_user.as_deref(), Some("nobody"));
    }

    #[test]
    fn insecure_compat_suppresses_xtab_verification() {
        let config = parse(
            "insecure_compatibility = true\n\
             xtab_verification = true\n",
        );
        assert!(config.insecure_compat);
        assert!(!config.xtab_verification);
    }

    #[test]
    fn whitespace_and_case() {
        let config = parse("  local_only   =  TRUE  \n");
        assert!(config.local_only);
    }
}
