//! Command registry
//!
//! The closed set of command names the embedded image answers to. Membership
//! here is the only test for "runnable"; anything else is turned away before
//! an image instance is ever booted.

use std::str::FromStr;

/// Names that are recognized but deliberately not emulated yet
pub const UNSUPPORTED: &[&str] = &["node"];

/// What a command mostly does. Drives the image identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Text,
    Files,
    Checksum,
    Archive(ArchiveMode),
    System,
}

/// Direction of an archiving command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveMode {
    Read,
    Write,
    /// Both creates and extracts (tar)
    Both,
}

/// Program identity the image uses for write-side archiving
pub const ARCHIVE_WRITER_IDENTITY: &str = "nanozip";

macro_rules! commands {
    ($( $(#[$doc:meta])* $variant:ident => $name:literal, )*) => {
        /// A supported command
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum Command {
            $( $(#[$doc])* $variant, )*
        }

        impl Command {
            /// Every supported command, in registry order
            pub const ALL: &'static [Command] = &[ $( Command::$variant, )* ];

            /// The name callers invoke
            pub fn name(self) -> &'static str {
                match self {
                    $( Command::$variant => $name, )*
                }
            }
        }
    };
}

commands! {
    /// Pattern scanning and processing language
    Awk => "awk",
    /// Base64 encode or decode
    Base64 => "base64",
    /// Strip directory and suffix from a path
    Basename => "basename",
    /// The multi-call binary itself; prints its help
    Busybox => "busybox",
    /// Concatenate files to stdout
    Cat => "cat",
    Chmod => "chmod",
    Chown => "chown",
    /// CRC32 checksums
    Cksum => "cksum",
    /// Clear the terminal
    Clear => "clear",
    /// Project companion CLI
    Companion => "companion",
    Cp => "cp",
    Date => "date",
    Diff => "diff",
    /// Strip the last path component
    Dirname => "dirname",
    Echo => "echo",
    Egrep => "egrep",
    Env => "env",
    Expr => "expr",
    /// Exit with status 1
    False => "false",
    Fgrep => "fgrep",
    Find => "find",
    Grep => "grep",
    /// `hexdump -C`
    Hd => "hd",
    Head => "head",
    Hexdump => "hexdump",
    Link => "link",
    Ln => "ln",
    Ls => "ls",
    Md5sum => "md5sum",
    Mkdir => "mkdir",
    Mkfifo => "mkfifo",
    Mknod => "mknod",
    Mktemp => "mktemp",
    Mv => "mv",
    /// Zip and unzip files or directories
    Nanozip => "nanozip",
    Patch => "patch",
    Printenv => "printenv",
    Printf => "printf",
    Pwd => "pwd",
    Readlink => "readlink",
    Realpath => "realpath",
    Rm => "rm",
    Rmdir => "rmdir",
    Sed => "sed",
    Sha256sum => "sha256sum",
    Sleep => "sleep",
    Sort => "sort",
    Split => "split",
    Stat => "stat",
    Tail => "tail",
    /// Create, extract or list tar archives
    Tar => "tar",
    Test => "test",
    Touch => "touch",
    /// Exit with status 0
    True => "true",
    Uniq => "uniq",
    Unlink => "unlink",
    /// Extract zip archives
    Unzip => "unzip",
    Usleep => "usleep",
    Whoami => "whoami",
    Xargs => "xargs",
    /// Alias of `nanozip`
    Zip => "zip",
}

impl Command {
    /// Look a name up in the registry
    pub fn lookup(name: &str) -> Option<Command> {
        Self::ALL.iter().copied().find(|cmd| cmd.name() == name)
    }

    /// Is `name` a known-but-unimplemented target
    pub fn is_unsupported(name: &str) -> bool {
        UNSUPPORTED.contains(&name)
    }

    pub fn family(self) -> Family {
        match self {
            Command::Awk
            | Command::Base64
            | Command::Cat
            | Command::Diff
            | Command::Echo
            | Command::Egrep
            | Command::Expr
            | Command::Fgrep
            | Command::Grep
            | Command::Hd
            | Command::Head
            | Command::Hexdump
            | Command::Patch
            | Command::Printf
            | Command::Sed
            | Command::Sort
            | Command::Split
            | Command::Tail
            | Command::Uniq
            | Command::Xargs => Family::Text,

            Command::Basename
            | Command::Chmod
            | Command::Chown
            | Command::Cp
            | Command::Dirname
            | Command::Find
            | Command::Link
            | Command::Ln
            | Command::Ls
            | Command::Mkdir
            | Command::Mkfifo
            | Command::Mknod
            | Command::Mktemp
            | Command::Mv
            | Command::Pwd
            | Command::Readlink
            | Command::Realpath
            | Command::Rm
            | Command::Rmdir
            | Command::Stat
            | Command::Touch
            | Command::Unlink => Family::Files,

            Command::Cksum | Command::Md5sum | Command::Sha256sum => Family::Checksum,

            Command::Nanozip | Command::Zip => Family::Archive(ArchiveMode::Write),
            Command::Unzip => Family::Archive(ArchiveMode::Read),
            Command::Tar => Family::Archive(ArchiveMode::Both),

            Command::Busybox
            | Command::Clear
            | Command::Companion
            | Command::Date
            | Command::Env
            | Command::False
            | Command::Printenv
            | Command::Sleep
            | Command::Test
            | Command::True
            | Command::Usleep
            | Command::Whoami => Family::System,
        }
    }

    /// Program name the image instance is booted under.
    ///
    /// The image dispatches on this name, so write-side archiving presents
    /// a different identity than the read side.
    pub fn image_identity(self) -> &'static str {
        match self.family() {
            Family::Archive(ArchiveMode::Write) => ARCHIVE_WRITER_IDENTITY,
            Family::Archive(ArchiveMode::Read | ArchiveMode::Both)
            | Family::Text
            | Family::Files
            | Family::Checksum
            | Family::System => self.name(),
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Name outside the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownCommand(pub String);

impl std::fmt::Display for UnknownCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown command: {}", self.0)
    }
}

impl std::error::Error for UnknownCommand {}

impl FromStr for Command {
    type Err = UnknownCommand;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Command::lookup(s).ok_or_else(|| UnknownCommand(s.to_string()))
    }
}
