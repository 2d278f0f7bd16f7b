use std::io::Write;
use std::process::{Command, Stdio};

use tracing::{error, warn};

use crate::config::MailConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Warn,
    Error,
}

impl NoticeLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoticeLevel::Warn => "WARN",
            NoticeLevel::Error => "ERROR",
        }
    }
}

/// Something an operator has to look at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub project: String,
    pub sample: Option<String>,
    pub workflow: Option<String>,
    pub message: String,
}

impl Notice {
    pub fn error(project: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Error,
            project: project.into(),
            sample: None,
            workflow: None,
            message: message.into(),
        }
    }

    pub fn warn(project: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Warn,
            ..Self::error(project, message)
        }
    }

    pub fn with_sample(mut self, sample: impl Into<String>) -> Self {
        self.sample = Some(sample.into());
        self
    }

    pub fn with_workflow(mut self, workflow: impl Into<String>) -> Self {
        self.workflow = Some(workflow.into());
        self
    }

    pub fn subject(&self) -> String {
        let mut subject = format!("[{}]", self.project);
        if let Some(sample) = &self.sample {
            subject.push_str(&format!(" [{sample}]"));
        }
        if let Some(workflow) = &self.workflow {
            subject.push_str(&format!(" [{workflow}]"));
        }
        format!(
            "{subject} [{}] analysis intervention required",
            self.level.as_str()
        )
    }

    pub fn body(&self) -> String {
        let mut body = format!("Project: {}\n", self.project);
        if let Some(sample) = &self.sample {
            body.push_str(&format!("Sample: {sample}\n"));
        }
        if let Some(workflow) = &self.workflow {
            body.push_str(&format!("Workflow: {workflow}\n"));
        }
        body.push_str(&format!("\n{}\n", self.message));
        body
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notice: &Notice);
}

/// Writes notices to the log only.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notice: &Notice) {
        match notice.level {
            NoticeLevel::Warn => warn!(subject = %notice.subject(), "{}", notice.message),
            NoticeLevel::Error => error!(subject = %notice.subject(), "{}", notice.message),
        }
    }
}

/// Logs every notice and mails it through `sendmail -t`.
#[derive(Debug, Clone)]
pub struct SendmailNotifier {
    recipient: String,
    sender: String,
    program: String,
}

impl SendmailNotifier {
    pub fn new(recipient: String, config: &MailConfig) -> Self {
        Self {
            recipient,
            sender: config.sender.clone(),
            program: config.sendmail.clone(),
        }
    }

    pub fn message(&self, notice: &Notice) -> String {
        format!(
            "From: {}\nTo: {}\nSubject: {}\n\n{}",
            self.sender,
            self.recipient,
            notice.subject(),
            notice.body()
        )
    }

    fn send(&self, notice: &Notice) -> std::io::Result<()> {
        let mut child = Command::new(&self.program)
            .arg("-t")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()?;
        if let Some(stdin) = child.stdin.as_mut() {
            stdin.write_all(self.message(notice).as_bytes())?;
        }
        let status = child.wait()?;
        if !status.success() {
            return Err(std::io::Error::other(format!(
                "{} exited with {status}",
                self.program
            )));
        }
        Ok(())
    }
}

impl Notifier for SendmailNotifier {
    fn notify(&self, notice: &Notice) {
        LogNotifier.notify(notice);
        if let Err(err) = self.send(notice) {
            warn!(recipient = %self.recipient, error = %err, "could not mail operator notice");
        }
    }
}

/// Mail when a recipient is configured and notices are wanted, log otherwise.
pub fn notifier_from_config(config: &MailConfig, quiet: bool) -> Box<dyn Notifier> {
    match (&config.recipient, quiet) {
        (Some(recipient), false) => Box::new(SendmailNotifier::new(recipient.clone(), config)),
        _ => Box::new(LogNotifier),
    }
}
