//! CommandExecutor (spec §4.4): safe execution of an enumerated set of
//! side-effectful commands. The executor refuses anything outside the set;
//! planner output (a [`PlannedCommand`] list) is resolved against the set
//! before it is ever spawned.

use std::path::Path;
use std::time::{Duration, Instant};

use orc_db::models::{CommandPhase, PlannedCommand};
use tokio::io::AsyncReadExt;
use tokio::process::Command as TokioCommand;

/// Package manager choices for the `install` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Npm,
    Pnpm,
    Yarn,
    Cargo,
}

impl PackageManager {
    fn program(self) -> &'static str {
        match self {
            Self::Npm => "npm",
            Self::Pnpm => "pnpm",
            Self::Yarn => "yarn",
            Self::Cargo => "cargo",
        }
    }

    fn install_args<'a>(self, packages: &'a [String]) -> Vec<&'a str> {
        let mut args = match self {
            Self::Npm => vec!["install"],
            Self::Pnpm => vec!["add"],
            Self::Yarn => vec!["add"],
            Self::Cargo => vec!["add"],
        };
        args.extend(packages.iter().map(String::as_str));
        args
    }
}

/// The two schema/migration tools the executor knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationTool {
    Prisma,
    Drizzle,
}

/// The enumerated command set (spec §4.4). Every variant has a fixed
/// argument shape; there is no "raw command" escape hatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    InstallPackages {
        manager: PackageManager,
        packages: Vec<String>,
    },
    MigrationGenerate {
        tool: MigrationTool,
        name: String,
    },
    MigrationApply {
        tool: MigrationTool,
    },
    MigrationPush {
        tool: MigrationTool,
    },
    CreateDirectory {
        path: String,
    },
    Typecheck,
    LintFix,
    Format,
}

/// Result of executing one command (spec §4.4 "Outputs").
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout_tail: String,
    pub stderr_tail: String,
    pub duration_ms: i64,
}

/// Error returned when a planner-supplied command does not match any
/// enumerated shape.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("command not in the enumerated set: {0:?} {1:?}")]
pub struct UnknownCommandError(pub String, pub Vec<String>);

const TAIL_BYTES: usize = 4000;

/// Resolve a planner-supplied [`PlannedCommand`] against the enumerated
/// set. Anything that doesn't match a known shape is refused.
pub fn resolve(planned: &PlannedCommand) -> Result<Command, UnknownCommandError> {
    let refuse = || UnknownCommandError(planned.command.clone(), planned.args.clone());

    match planned.command.as_str() {
        "npm" if planned.args.first().map(String::as_str) == Some("install") => {
            Ok(Command::InstallPackages {
                manager: PackageManager::Npm,
                packages: planned.args[1..].to_vec(),
            })
        }
        "pnpm" if planned.args.first().map(String::as_str) == Some("add") => {
            Ok(Command::InstallPackages {
                manager: PackageManager::Pnpm,
                packages: planned.args[1..].to_vec(),
            })
        }
        "yarn" if planned.args.first().map(String::as_str) == Some("add") => {
            Ok(Command::InstallPackages {
                manager: PackageManager::Yarn,
                packages: planned.args[1..].to_vec(),
            })
        }
        "cargo" => match planned.args.first().map(String::as_str) {
            Some("add") => Ok(Command::InstallPackages {
                manager: PackageManager::Cargo,
                packages: planned.args[1..].to_vec(),
            }),
            Some("check") => Ok(Command::Typecheck),
            Some("fmt") => Ok(Command::Format),
            Some("clippy") if planned.args.iter().any(|a| a == "--fix") => Ok(Command::LintFix),
            _ => Err(refuse()),
        },
        "prisma" => migration_command(MigrationTool::Prisma, &planned.args).ok_or_else(refuse),
        "drizzle-kit" => migration_command(MigrationTool::Drizzle, &planned.args).ok_or_else(refuse),
        "mkdir" if planned.args.len() == 1 => Ok(Command::CreateDirectory {
            path: planned.args[0].clone(),
        }),
        _ => Err(refuse()),
    }
}

fn migration_command(tool: MigrationTool, args: &[String]) -> Option<Command> {
    match args.first().map(String::as_str) {
        Some("generate") | Some("migrate") if args.get(1).map(String::as_str) == Some("dev") => {
            Some(Command::MigrationGenerate {
                tool,
                name: args.get(2).cloned().unwrap_or_default(),
            })
        }
        Some("generate") => Some(Command::MigrationGenerate {
            tool,
            name: args.get(1).cloned().unwrap_or_default(),
        }),
        Some("deploy") | Some("migrate") if args.get(1).map(String::as_str) == Some("deploy") => {
            Some(Command::MigrationApply { tool })
        }
        Some("push") => Some(Command::MigrationPush { tool }),
        _ => None,
    }
}

/// Execute a resolved command in `working_dir`, returning
/// `(success, exitCode, stdoutTail, stderrTail, durationMs)`.
pub async fn execute(command: &Command, working_dir: &Path) -> anyhow::Result<CommandOutcome> {
    let (program, args): (&str, Vec<String>) = match command {
        Command::InstallPackages { manager, packages } => (
            manager.program(),
            manager
                .install_args(packages)
                .into_iter()
                .map(str::to_owned)
                .collect(),
        ),
        Command::MigrationGenerate { tool, name } => match tool {
            MigrationTool::Prisma => (
                "prisma",
                vec!["migrate".into(), "dev".into(), "--name".into(), name.clone()],
            ),
            MigrationTool::Drizzle => ("drizzle-kit", vec!["generate".into()]),
        },
        Command::MigrationApply { tool } => match tool {
            MigrationTool::Prisma => ("prisma", vec!["migrate".into(), "deploy".into()]),
            MigrationTool::Drizzle => ("drizzle-kit", vec!["migrate".into()]),
        },
        Command::MigrationPush { tool } => match tool {
            MigrationTool::Prisma => ("prisma", vec!["db".into(), "push".into()]),
            MigrationTool::Drizzle => ("drizzle-kit", vec!["push".into()]),
        },
        Command::CreateDirectory { path } => ("mkdir", vec!["-p".into(), path.clone()]),
        Command::Typecheck => ("cargo", vec!["check".into()]),
        Command::LintFix => ("cargo", vec!["clippy".into(), "--fix".into(), "--allow-dirty".into()]),
        Command::Format => ("cargo", vec!["fmt".into()]),
    };

    run(program, &args, working_dir, Duration::from_secs(300)).await
}

async fn run(
    program: &str,
    args: &[String],
    working_dir: &Path,
    timeout: Duration,
) -> anyhow::Result<CommandOutcome> {
    let start = Instant::now();
    let mut child = TokioCommand::new(program)
        .args(args)
        .current_dir(working_dir)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()?;

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();

    let read_stdout = async {
        let mut buf = Vec::new();
        if let Some(ref mut pipe) = stdout_pipe {
            pipe.read_to_end(&mut buf).await.ok();
        }
        String::from_utf8_lossy(&buf).into_owned()
    };
    let read_stderr = async {
        let mut buf = Vec::new();
        if let Some(ref mut pipe) = stderr_pipe {
            pipe.read_to_end(&mut buf).await.ok();
        }
        String::from_utf8_lossy(&buf).into_owned()
    };

    match tokio::time::timeout(timeout, async {
        tokio::join!(child.wait(), read_stdout, read_stderr)
    })
    .await
    {
        Ok((Ok(status), stdout, stderr)) => {
            let duration_ms = i64::try_from(start.elapsed().as_millis()).unwrap_or(i64::MAX);
            Ok(CommandOutcome {
                success: status.success(),
                exit_code: status.code(),
                stdout_tail: tail(&stdout),
                stderr_tail: tail(&stderr),
                duration_ms,
            })
        }
        Ok((Err(err), _, _)) => Err(err.into()),
        Err(_) => {
            let _ = child.kill().await;
            let duration_ms = i64::try_from(start.elapsed().as_millis()).unwrap_or(i64::MAX);
            Ok(CommandOutcome {
                success: false,
                exit_code: None,
                stdout_tail: String::new(),
                stderr_tail: format!("{program} timed out after {}s", timeout.as_secs()),
                duration_ms,
            })
        }
    }
}

fn tail(s: &str) -> String {
    if s.len() <= TAIL_BYTES {
        s.to_owned()
    } else {
        s[s.len() - TAIL_BYTES..].to_owned()
    }
}

/// Split a task's planned command list into the `before_diff`/`after_diff`
/// buckets the Coding handler runs around the coder's diff (spec §4.4).
pub fn split_by_phase(commands: &[PlannedCommand]) -> (Vec<&PlannedCommand>, Vec<&PlannedCommand>) {
    let before = commands
        .iter()
        .filter(|c| c.phase == CommandPhase::BeforeDiff)
        .collect();
    let after = commands
        .iter()
        .filter(|c| c.phase == CommandPhase::AfterDiff)
        .collect();
    (before, after)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn planned(command: &str, args: &[&str]) -> PlannedCommand {
        PlannedCommand {
            command: command.to_owned(),
            args: args.iter().map(|s| (*s).to_owned()).collect(),
            phase: CommandPhase::BeforeDiff,
        }
    }

    #[test]
    fn resolves_npm_install() {
        let cmd = resolve(&planned("npm", &["install", "left-pad"])).unwrap();
        assert_eq!(
            cmd,
            Command::InstallPackages {
                manager: PackageManager::Npm,
                packages: vec!["left-pad".to_owned()]
            }
        );
    }

    #[test]
    fn resolves_cargo_check_as_typecheck() {
        let cmd = resolve(&planned("cargo", &["check"])).unwrap();
        assert_eq!(cmd, Command::Typecheck);
    }

    #[test]
    fn resolves_prisma_migrate_dev() {
        let cmd = resolve(&planned("prisma", &["migrate", "dev", "init"])).unwrap();
        assert_eq!(
            cmd,
            Command::MigrationGenerate {
                tool: MigrationTool::Prisma,
                name: "init".to_owned()
            }
        );
    }

    #[test]
    fn refuses_arbitrary_command() {
        let err = resolve(&planned("rm", &["-rf", "/"])).unwrap_err();
        assert_eq!(err.0, "rm");
    }

    #[test]
    fn refuses_unrecognized_subcommand() {
        assert!(resolve(&planned("cargo", &["publish"])).is_err());
    }

    #[test]
    fn splits_commands_by_phase() {
        let commands = vec![
            PlannedCommand {
                command: "npm".into(),
                args: vec!["install".into()],
                phase: CommandPhase::BeforeDiff,
            },
            PlannedCommand {
                command: "cargo".into(),
                args: vec!["fmt".into()],
                phase: CommandPhase::AfterDiff,
            },
        ];
        let (before, after) = split_by_phase(&commands);
        assert_eq!(before.len(), 1);
        assert_eq!(after.len(), 1);
    }
}
