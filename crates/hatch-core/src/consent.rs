//! Consent gate: decides once per request whether a plan may execute.
//!
//! The decision itself is the pure function [`decide`]; only the
//! [`ConsentDecision::Prompt`] outcome reaches a [`ConsentPrompt`], which
//! is the single place execution may block on user input.

use crate::CoreError;
use hatch_schema::InstallationPlan;
use serde::Serialize;
use std::io::{BufRead, BufReader, IsTerminal, Stderr, Stdin, Write};
use std::sync::Mutex;
use tracing::{debug, info};

/// Environment override that approves installation without prompting.
pub const AUTO_APPROVE_ENV: &str = "HATCH_AUTO_APPROVE";

/// Caller-supplied consent flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsentFlags {
    pub auto_approve: bool,
    pub refuse: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalReason {
    Flag,
    Environment,
    NonInteractive,
    User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsentDecision {
    Refuse,
    Approve(ApprovalReason),
    Prompt,
}

/// Case-insensitive `1`, `true` or `yes`.
pub fn env_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes"
    )
}

/// First matching rule wins: refuse flag, approve flag, environment
/// override, non-interactive session, then prompt.
pub fn decide(flags: ConsentFlags, env_value: Option<&str>, interactive: bool) -> ConsentDecision {
    if flags.refuse {
        ConsentDecision::Refuse
    } else if flags.auto_approve {
        ConsentDecision::Approve(ApprovalReason::Flag)
    } else if env_value.is_some_and(env_truthy) {
        ConsentDecision::Approve(ApprovalReason::Environment)
    } else if !interactive {
        ConsentDecision::Approve(ApprovalReason::NonInteractive)
    } else {
        ConsentDecision::Prompt
    }
}

/// Synchronous yes/no question shown to the user.
pub trait ConsentPrompt: Send {
    fn confirm(&mut self, plan_summary: &str) -> Result<bool, CoreError>;
}

/// Line-based prompt over any reader and writer.
///
/// `y`/`yes` approves and `n`/`no` denies; any other answer, including an
/// empty line, asks again. End of input denies.
pub struct LinePrompt<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> LinePrompt<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }
}

impl LinePrompt<BufReader<Stdin>, Stderr> {
    pub fn stdio() -> Self {
        Self::new(BufReader::new(std::io::stdin()), std::io::stderr())
    }
}

impl<R: BufRead + Send, W: Write + Send> ConsentPrompt for LinePrompt<R, W> {
    fn confirm(&mut self, plan_summary: &str) -> Result<bool, CoreError> {
        write!(self.output, "{plan_summary}")?;
        loop {
            write!(self.output, "Proceed with installation? [y/n]: ")?;
            self.output.flush()?;
            let mut line = String::new();
            if self.input.read_line(&mut line)? == 0 {
                writeln!(self.output)?;
                return Ok(false);
            }
            match line.trim().to_ascii_lowercase().as_str() {
                "y" | "yes" => return Ok(true),
                "n" | "no" => return Ok(false),
                _ => writeln!(self.output, "Please answer 'y' or 'n'.")?,
            }
        }
    }
}

type InteractiveProbe = Box<dyn Fn() -> bool + Send + Sync>;
type EnvLookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

fn stdio_is_interactive() -> bool {
    std::io::stdin().is_terminal() && std::io::stderr().is_terminal()
}

/// Applies [`decide`] against live process state and runs the prompt
/// when required.
pub struct ConsentGate {
    prompt: Mutex<Box<dyn ConsentPrompt>>,
    interactive: InteractiveProbe,
    env: EnvLookup,
}

impl ConsentGate {
    pub fn new(prompt: impl ConsentPrompt + 'static) -> Self {
        Self {
            prompt: Mutex::new(Box::new(prompt)),
            interactive: Box::new(stdio_is_interactive),
            env: Box::new(|name| std::env::var(name).ok()),
        }
    }

    /// Gate reading from stdin and writing to stderr.
    pub fn stdio() -> Self {
        Self::new(LinePrompt::stdio())
    }

    #[must_use]
    pub fn with_interactive(mut self, probe: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.interactive = Box::new(probe);
        self
    }

    #[must_use]
    pub fn with_env_lookup(
        mut self,
        lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.env = Box::new(lookup);
        self
    }

    pub fn evaluate(
        &self,
        plan: &InstallationPlan,
        flags: ConsentFlags,
    ) -> Result<ApprovalReason, CoreError> {
        let env_value = (self.env)(AUTO_APPROVE_ENV);
        let decision = decide(flags, env_value.as_deref(), (self.interactive)());
        debug!("consent decision for '{}': {decision:?}", plan.package());

        match decision {
            ConsentDecision::Refuse => Err(CoreError::ConsentDenied(
                "installation refused by caller".to_owned(),
            )),
            ConsentDecision::Approve(reason) => {
                info!("installation of '{}' approved ({reason:?})", plan.package());
                Ok(reason)
            }
            ConsentDecision::Prompt => {
                let mut prompt = self
                    .prompt
                    .lock()
                    .map_err(|_| CoreError::ConsentDenied("consent prompt unavailable".to_owned()))?;
                if prompt.confirm(&plan.summary())? {
                    Ok(ApprovalReason::User)
                } else {
                    Err(CoreError::ConsentDenied("declined by user".to_owned()))
                }
            }
        }
    }
}
