//! Command flows executed over a remote session
//!
//! A [`SessionFlow`] groups commands into three stages: setup runs once
//! after every (re)connect, the command stage runs every tick, teardown
//! runs once before disconnect. Each [`CommandSpec`] can carry an
//! [`OutputParser`] that turns raw command output into pending writes for
//! the persistence pipeline.

use crate::data_unit::DataUnit;
use crate::error::Result;

/// Stage of a session flow a command belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStage {
    Setup,
    Command,
    Teardown,
}

impl FlowStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Setup => "setup",
            Self::Command => "command",
            Self::Teardown => "teardown",
        }
    }
}

/// Raw result of one remote command
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub rc: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.rc == 0
    }
}

/// Context handed to parsers alongside the raw output
#[derive(Debug, Clone)]
pub struct ParseContext {
    /// `HOST_ID` of the host the command ran on
    pub host_id: i64,
    /// Tick timestamp shared by every command of the cycle
    pub timestamp: String,
}

/// Turns raw command output into pending writes
///
/// Implemented directly for closures, so most parsers are written inline:
/// table-specific structs are only needed when a parser carries state.
pub trait OutputParser: Send {
    fn parse(&self, ctx: &ParseContext, output: &CommandOutput) -> Result<Vec<DataUnit>>;
}

impl<F> OutputParser for F
where
    F: Fn(&ParseContext, &CommandOutput) -> Result<Vec<DataUnit>> + Send + Sync,
{
    fn parse(&self, ctx: &ParseContext, output: &CommandOutput) -> Result<Vec<DataUnit>> {
        self(ctx, output)
    }
}

/// One command to run remotely, with optional sudo and working directory
pub struct CommandSpec {
    text: String,
    sudo: bool,
    sudo_password: Option<String>,
    directory: Option<String>,
    background: bool,
    parser: Option<Box<dyn OutputParser>>,
}

impl CommandSpec {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            sudo: false,
            sudo_password: None,
            directory: None,
            background: false,
            parser: None,
        }
    }

    /// Run under sudo; a password switches to `sudo -S` with a piped echo
    pub fn with_sudo(mut self, password: Option<String>) -> Self {
        self.sudo = true;
        self.sudo_password = password;
        self
    }

    /// Prefix the command with a `cd` into `directory`
    pub fn in_directory(mut self, directory: impl Into<String>) -> Self {
        self.directory = Some(directory.into());
        self
    }

    /// Launch without waiting for completion; no output is captured and
    /// any attached parser never runs
    pub fn in_background(mut self) -> Self {
        self.background = true;
        self
    }

    /// Attach the parser that turns this command's output into writes
    pub fn with_parser(mut self, parser: impl OutputParser + 'static) -> Self {
        self.parser = Some(Box::new(parser));
        self
    }

    /// The literal command text, before sudo and directory wrapping
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_background(&self) -> bool {
        self.background
    }

    pub fn parser(&self) -> Option<&dyn OutputParser> {
        self.parser.as_deref()
    }

    /// Shell line actually sent over the transport
    pub fn rendered(&self) -> String {
        let mut line = if self.sudo {
            match &self.sudo_password {
                Some(password) => format!("echo {password} | sudo -S {}", self.text),
                None => format!("sudo {}", self.text),
            }
        } else {
            self.text.clone()
        };
        if let Some(directory) = &self.directory {
            line = format!("cd {directory} && {line}");
        }
        line
    }
}

impl std::fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandSpec")
            .field("text", &self.text)
            .field("sudo", &self.sudo)
            .field("directory", &self.directory)
            .field("background", &self.background)
            .field("has_parser", &self.parser.is_some())
            .finish_non_exhaustive()
    }
}

/// The three command stages a session runner drives
#[derive(Debug, Default)]
pub struct SessionFlow {
    setup: Vec<CommandSpec>,
    commands: Vec<CommandSpec>,
    teardown: Vec<CommandSpec>,
}

impl SessionFlow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a command run once after every (re)connect
    pub fn setup(mut self, command: CommandSpec) -> Self {
        self.setup.push(command);
        self
    }

    /// Append a command run on every tick
    pub fn command(mut self, command: CommandSpec) -> Self {
        self.commands.push(command);
        self
    }

    /// Append a command run once before disconnect
    pub fn teardown(mut self, command: CommandSpec) -> Self {
        self.teardown.push(command);
        self
    }

    /// Commands of `stage`, in insertion order
    pub fn stage(&self, stage: FlowStage) -> &[CommandSpec] {
        match stage {
            FlowStage::Setup => &self.setup,
            FlowStage::Command => &self.commands,
            FlowStage::Teardown => &self.teardown,
        }
    }

    /// Whether the periodic stage has any commands at all
    pub fn has_commands(&self) -> bool {
        !self.commands.is_empty()
    }
}
