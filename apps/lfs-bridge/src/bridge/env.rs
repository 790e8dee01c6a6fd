//! Environment forwarding for bridge children.
//!
//! Children start from an empty environment. Only the names and prefixes on
//! the allow-list are copied over from the adapter's own environment.

use std::collections::BTreeSet;
use std::ffi::{OsStr, OsString};

use tokio::process::Command;

pub const DEFAULT_NAMES: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "LOGNAME",
    "LANG",
    "LANGUAGE",
    "TZ",
    "TMPDIR",
    "TEMP",
    "TMP",
    "XDG_RUNTIME_DIR",
    "XDG_CONFIG_HOME",
    "XDG_DATA_HOME",
    "XDG_CACHE_HOME",
    "SYSTEMROOT",
    "WINDIR",
    "COMSPEC",
    "PATHEXT",
    "USERPROFILE",
    "APPDATA",
    "LOCALAPPDATA",
    "PROGRAMDATA",
];

pub const DEFAULT_PREFIXES: &[&str] = &["LC_", "LFS_BRIDGE_"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvAllowlist {
    names: BTreeSet<String>,
    prefixes: Vec<String>,
}

impl Default for EnvAllowlist {
    fn default() -> Self {
        Self {
            names: DEFAULT_NAMES.iter().map(|name| name.to_string()).collect(),
            prefixes: DEFAULT_PREFIXES.iter().map(|prefix| prefix.to_string()).collect(),
        }
    }
}

impl EnvAllowlist {
    pub fn empty() -> Self {
        Self {
            names: BTreeSet::new(),
            prefixes: Vec::new(),
        }
    }

    /// Adds configured entries. A trailing `*` makes the entry a prefix.
    pub fn extend<I, S>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for entry in entries {
            let entry = entry.as_ref().trim();
            if entry.is_empty() {
                continue;
            }
            match entry.strip_suffix('*') {
                Some(prefix) if !prefix.is_empty() => self.prefixes.push(prefix.to_string()),
                Some(_) => {}
                None => {
                    self.names.insert(entry.to_string());
                }
            }
        }
        self
    }

    pub fn is_allowed(&self, name: &OsStr) -> bool {
        let Some(name) = name.to_str() else {
            return false;
        };
        self.names.contains(name) || self.prefixes.iter().any(|prefix| name.starts_with(prefix))
    }

    pub fn filter<I>(&self, vars: I) -> Vec<(OsString, OsString)>
    where
        I: IntoIterator<Item = (OsString, OsString)>,
    {
        vars.into_iter()
            .filter(|(name, _)| self.is_allowed(name))
            .collect()
    }

    /// Clears the command's environment and copies the allowed variables
    /// from the current process.
    pub fn apply(&self, command: &mut Command) {
        self.apply_from(command, std::env::vars_os());
    }

    /// Like [`EnvAllowlist::apply`], with `vars` standing in for the
    /// current process environment.
    pub fn apply_from<I>(&self, command: &mut Command, vars: I)
    where
        I: IntoIterator<Item = (OsString, OsString)>,
    {
        command.env_clear();
        command.envs(self.filter(vars));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(OsString, OsString)> {
        pairs
            .iter()
            .map(|(k, v)| (OsString::from(k), OsString::from(v)))
            .collect()
    }

    fn names(filtered: Vec<(OsString, OsString)>) -> Vec<String> {
        filtered
            .into_iter()
            .map(|(name, _)| name.into_string().unwrap())
            .collect()
    }

    #[test]
    fn default_list_withholds_secrets() {
        let allow = EnvAllowlist::default();
        let kept = names(allow.filter(vars(&[
            ("PATH", "/usr/bin"),
            ("AWS_SECRET_ACCESS_KEY", "nope"),
            ("LC_ALL", "C"),
            ("LFS_BRIDGE_REGION", "eu"),
            ("GITHUB_TOKEN", "nope"),
            ("HOME", "/home/me"),
        ])));
        assert_eq!(kept, ["PATH", "LC_ALL", "LFS_BRIDGE_REGION", "HOME"]);
    }

    #[test]
    fn names_are_matched_exactly() {
        let allow = EnvAllowlist::default();
        assert!(!allow.is_allowed(OsStr::new("PATHX")));
        assert!(!allow.is_allowed(OsStr::new("path")));
        assert!(!allow.is_allowed(OsStr::new("LFS_BRIDGE")));
    }

    #[test]
    fn extend_adds_names_and_prefixes() {
        let allow = EnvAllowlist::empty().extend(["DOTNET_ROOT", "NODE_*", " ", "*"]);
        assert!(allow.is_allowed(OsStr::new("DOTNET_ROOT")));
        assert!(allow.is_allowed(OsStr::new("NODE_OPTIONS")));
        assert!(!allow.is_allowed(OsStr::new("DOTNET_CLI_HOME")));
        assert!(!allow.is_allowed(OsStr::new("ANYTHING")));
    }

    #[cfg(unix)]
    #[test_timeout::tokio_timeout_test(30)]
    async fn spawned_child_receives_only_allowed_variables() {
        let mut command = Command::new("/bin/sh");
        command.args(["-c", "env"]);
        EnvAllowlist::default().apply_from(
            &mut command,
            vars(&[
                ("PATH", "/usr/bin:/bin"),
                ("AWS_SECRET_ACCESS_KEY", "hunter2"),
                ("LFS_BRIDGE_REGION", "eu"),
                ("GITHUB_TOKEN", "ghp_secret"),
            ]),
        );
        let output = command.output().await.unwrap();
        assert!(output.status.success());
        let env = String::from_utf8(output.stdout).unwrap();
        assert!(env.lines().any(|line| line == "LFS_BRIDGE_REGION=eu"), "{env}");
        assert!(env.lines().any(|line| line == "PATH=/usr/bin:/bin"), "{env}");
        assert!(!env.contains("AWS_SECRET_ACCESS_KEY"), "{env}");
        assert!(!env.contains("hunter2"), "{env}");
        assert!(!env.contains("GITHUB_TOKEN"), "{env}");
    }
}
