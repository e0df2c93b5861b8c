use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::io::Read;
use std::time::Duration;

use anyhow::Result;
use packer_provisioner_itamae::communicator::{Communicator, RemoteCmd};
use packer_provisioner_itamae::guest::GuestOsType;
use packer_provisioner_itamae::provisioner::Provisioner;
use packer_provisioner_itamae::ui::Ui;
use tempfile::TempDir;

/// Communicator recording every interaction instead of reaching a machine.
///
/// Exit statuses are scripted per command substring; unmatched commands
/// exit with 0. The last scripted status of a rule repeats forever.
#[allow(dead_code)]
#[derive(Default)]
pub struct MockCommunicator {
    pub commands: RefCell<Vec<String>>,
    pub uploads: RefCell<Vec<(String, Vec<u8>)>>,
    pub dir_uploads: RefCell<Vec<(String, String)>>,
    statuses: RefCell<Vec<(String, VecDeque<i32>)>>,
    failing_uploads: bool,
}

#[allow(dead_code)]
impl MockCommunicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts the exit statuses of commands containing `pattern`.
    pub fn with_statuses(self, pattern: &str, statuses: &[i32]) -> Self {
        self.statuses
            .borrow_mut()
            .push((pattern.to_string(), statuses.iter().copied().collect()));
        self
    }

    /// Makes every upload fail with a transport error.
    pub fn with_failing_uploads(mut self) -> Self {
        self.failing_uploads = true;
        self
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.borrow().clone()
    }

    /// Returns how many dispatched commands contain `pattern`.
    pub fn count(&self, pattern: &str) -> usize {
        self.commands
            .borrow()
            .iter()
            .filter(|c| c.contains(pattern))
            .count()
    }
}

impl Communicator for MockCommunicator {
    fn start(&self, cmd: &RemoteCmd, _ui: &dyn Ui) -> Result<i32> {
        self.commands.borrow_mut().push(cmd.command().to_string());
        let mut statuses = self.statuses.borrow_mut();
        let status = statuses
            .iter_mut()
            .find(|(pattern, _)| cmd.command().contains(pattern.as_str()))
            .map(|(_, queue)| {
                if queue.len() > 1 {
                    queue.pop_front().unwrap_or(0)
                } else {
                    queue.front().copied().unwrap_or(0)
                }
            })
            .unwrap_or(0);
        Ok(status)
    }

    fn upload(&self, destination: &str, source: &mut dyn Read) -> Result<()> {
        if self.failing_uploads {
            anyhow::bail!("upload to {} refused", destination);
        }
        let mut content = Vec::new();
        source.read_to_end(&mut content)?;
        self.uploads
            .borrow_mut()
            .push((destination.to_string(), content));
        Ok(())
    }

    fn upload_dir(&self, destination: &str, source: &str) -> Result<()> {
        if self.failing_uploads {
            anyhow::bail!("upload to {} refused", destination);
        }
        self.dir_uploads
            .borrow_mut()
            .push((destination.to_string(), source.to_string()));
        Ok(())
    }
}

/// UI remembering everything it was told.
#[allow(dead_code)]
#[derive(Default)]
pub struct RecordingUi {
    pub says: RefCell<Vec<String>>,
    pub messages: RefCell<Vec<String>>,
    pub errors: RefCell<Vec<String>>,
}

#[allow(dead_code)]
impl RecordingUi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all output in one string, one line per call.
    pub fn output(&self) -> String {
        let mut lines = self.says.borrow().clone();
        lines.extend(self.messages.borrow().iter().cloned());
        lines.extend(self.errors.borrow().iter().cloned());
        lines.join("\n")
    }
}

impl Ui for RecordingUi {
    fn say(&self, message: &str) {
        self.says.borrow_mut().push(message.to_string());
    }

    fn message(&self, message: &str) {
        self.messages.borrow_mut().push(message.to_string());
    }

    fn error(&self, message: &str) {
        self.errors.borrow_mut().push(message.to_string());
    }
}

/// Temporary directory holding recipe files.
#[allow(dead_code)]
pub struct RecipeDir {
    pub dir: TempDir,
}

#[allow(dead_code)]
impl RecipeDir {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("failed to create temp dir"),
        }
    }

    /// Returns the directory path as a string.
    pub fn path(&self) -> String {
        self.dir.path().to_str().expect("temp dir path is not UTF-8").to_string()
    }

    /// Writes a file relative to the directory and returns its full path.
    pub fn write(&self, name: &str, content: &str) -> String {
        let path = self.dir.path().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("failed to create parent dir");
        }
        fs::write(&path, content).expect("failed to write recipe");
        path.to_str().expect("recipe path is not UTF-8").to_string()
    }
}

/// Parses a YAML configuration fragment.
#[allow(dead_code)]
pub fn fragment(yaml: &str) -> serde_yaml::Value {
    serde_yaml::from_str(yaml).expect("invalid YAML fragment")
}

/// Creates a provisioner for a Unix guest that retries without delay.
#[allow(dead_code)]
pub fn provisioner() -> Provisioner {
    Provisioner::new()
        .with_guest_os(GuestOsType::Unix)
        .with_retry_interval(Duration::from_millis(1))
}

/// Prepares a provisioner from YAML fragments, panicking on configuration errors.
#[allow(dead_code)]
pub fn prepared<S: AsRef<str>>(fragments: &[S]) -> Provisioner {
    let mut provisioner = provisioner();
    let fragments: Vec<serde_yaml::Value> = fragments.iter().map(|f| fragment(f.as_ref())).collect();
    provisioner
        .prepare(&fragments)
        .unwrap_or_else(|e| panic!("prepare failed: {}", e));
    provisioner
}
