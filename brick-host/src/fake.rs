//! In-memory host for tests.
//!
//! [`FakeHost`] is both a [`CommandRunner`] with scripted replies and a
//! [`DeviceTree`] backed by a path table. Commands are matched by prefix of
//! their command line (`program arg arg ...`); a matching command may also
//! create or remove paths, which is how tests model devices appearing after
//! a login or rescan and vanishing after a sysfs delete.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::devices::DeviceTree;
use crate::error::{HostError, Result};
use crate::executor::{CommandRunner, Exec, ExecOutput};

#[derive(Debug, Clone)]
enum Reply {
    Stdout(String),
    Exit(i32),
}

#[derive(Debug, Clone)]
struct Rule {
    prefix: String,
    reply: Reply,
    remaining: Option<usize>,
}

#[derive(Debug, Clone, Default)]
struct Effect {
    prefix: String,
    create: Vec<(PathBuf, Option<PathBuf>)>,
    remove: Vec<PathBuf>,
}

#[derive(Debug, Default)]
struct State {
    paths: BTreeMap<PathBuf, Option<PathBuf>>,
    rules: Vec<Rule>,
    effects: Vec<Effect>,
    calls: Vec<String>,
}

#[derive(Debug, Default)]
pub struct FakeHost {
    state: Mutex<State>,
}

fn command_line(exec: &Exec) -> String {
    let mut line = exec.program.clone();
    for arg in &exec.args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a plain path.
    pub fn add_path(&self, path: impl AsRef<Path>) {
        self.state().paths.insert(path.as_ref().to_path_buf(), None);
    }

    /// Add a symlink and its target.
    pub fn add_link(&self, link: impl AsRef<Path>, target: impl AsRef<Path>) {
        let mut state = self.state();
        state
            .paths
            .entry(target.as_ref().to_path_buf())
            .or_insert(None);
        state.paths.insert(
            link.as_ref().to_path_buf(),
            Some(target.as_ref().to_path_buf()),
        );
    }

    pub fn remove_path(&self, path: impl AsRef<Path>) {
        self.state().paths.remove(path.as_ref());
    }

    /// Reply with `stdout` to every command starting with `prefix`.
    pub fn respond(&self, prefix: &str, stdout: &str) {
        self.push_rule(prefix, Reply::Stdout(stdout.to_string()), None);
    }

    /// Fail every command starting with `prefix` with exit `code`.
    pub fn fail(&self, prefix: &str, code: i32) {
        self.push_rule(prefix, Reply::Exit(code), None);
    }

    /// Fail the next command starting with `prefix` with exit `code`.
    pub fn fail_once(&self, prefix: &str, code: i32) {
        self.push_rule(prefix, Reply::Exit(code), Some(1));
    }

    fn push_rule(&self, prefix: &str, reply: Reply, remaining: Option<usize>) {
        self.state().rules.push(Rule {
            prefix: prefix.to_string(),
            reply,
            remaining,
        });
    }

    /// When a command starting with `prefix` runs, create `link -> target`.
    pub fn link_on_run(&self, prefix: &str, link: impl AsRef<Path>, target: impl AsRef<Path>) {
        self.state().effects.push(Effect {
            prefix: prefix.to_string(),
            create: vec![(
                link.as_ref().to_path_buf(),
                Some(target.as_ref().to_path_buf()),
            )],
            remove: Vec::new(),
        });
    }

    /// When a command starting with `prefix` runs, remove `paths`.
    pub fn remove_on_run(&self, prefix: &str, paths: &[&str]) {
        self.state().effects.push(Effect {
            prefix: prefix.to_string(),
            create: Vec::new(),
            remove: paths.iter().map(PathBuf::from).collect(),
        });
    }

    /// Command lines executed so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    /// Number of executed commands starting with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|line| line.starts_with(prefix))
            .count()
    }
}

impl CommandRunner for FakeHost {
    fn run(&self, exec: &Exec) -> Result<ExecOutput> {
        let line = command_line(exec);
        let mut state = self.state();
        state.calls.push(line.clone());

        let effects: Vec<Effect> = state
            .effects
            .iter()
            .filter(|effect| line.starts_with(&effect.prefix))
            .cloned()
            .collect();
        for effect in effects {
            for path in &effect.remove {
                state.paths.remove(path);
            }
            for (path, target) in effect.create {
                if let Some(target) = &target {
                    state.paths.entry(target.clone()).or_insert(None);
                }
                state.paths.insert(path, target);
            }
        }

        let reply = state
            .rules
            .iter_mut()
            .find(|rule| line.starts_with(&rule.prefix) && rule.remaining != Some(0))
            .map(|rule| {
                if let Some(remaining) = rule.remaining.as_mut() {
                    *remaining -= 1;
                }
                rule.reply.clone()
            });

        match reply {
            Some(Reply::Exit(code)) if !exec.ok_codes.contains(&code) => {
                Err(HostError::ProcessExecution {
                    program: exec.program.clone(),
                    exit_code: Some(code),
                    stdout: String::new(),
                    stderr: format!("exit {}", code),
                })
            }
            Some(Reply::Exit(_)) | None => Ok(ExecOutput::default()),
            Some(Reply::Stdout(stdout)) => Ok(ExecOutput {
                stdout,
                stderr: String::new(),
            }),
        }
    }
}

impl DeviceTree for FakeHost {
    fn exists(&self, path: &Path) -> bool {
        self.state().paths.contains_key(path)
    }

    fn realpath(&self, path: &Path) -> PathBuf {
        let state = self.state();
        let mut current = path.to_path_buf();
        for _ in 0..8 {
            match state.paths.get(&current) {
                Some(Some(target)) => current = target.clone(),
                _ => break,
            }
        }
        current
    }

    fn glob(&self, pattern: &str) -> Vec<PathBuf> {
        let Ok(pattern) = glob::Pattern::new(pattern) else {
            return Vec::new();
        };
        self.state()
            .paths
            .keys()
            .filter(|path| pattern.matches_path(path))
            .cloned()
            .collect()
    }

    fn list_dir(&self, dir: &Path) -> Vec<String> {
        self.state()
            .paths
            .keys()
            .filter(|path| path.parent() == Some(dir))
            .filter_map(|path| path.file_name())
            .map(|name| name.to_string_lossy().to_string())
            .collect()
    }
}
