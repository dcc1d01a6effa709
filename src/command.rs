//! Operator supplied commands (proxy validation and reload, DNS hooks).

use std::process::Stdio;

use eyre::{eyre, WrapErr as _};

/// Result of a finished command.
#[derive(Debug, Clone)]
pub(crate) struct CommandOutput {
    pub(crate) success: bool,
    pub(crate) code: Option<i32>,
    pub(crate) stderr: String,
}

impl CommandOutput {
    /// Short description for error details: exit code and trimmed stderr.
    pub(crate) fn describe(&self) -> String {
        let code = self
            .code
            .map_or_else(|| "killed by signal".to_owned(), |code| format!("exit code {code}"));

        match self.stderr.trim() {
            "" => code,
            stderr => format!("{code}: {stderr}"),
        }
    }
}

/// Runs `argv` to completion, with `{name}` placeholders in its arguments substituted from `vars`.
///
/// The same variables are exported to the child as `CERTSYNC_<NAME>`.
pub(crate) async fn run(argv: &[String], vars: &[(&str, &str)]) -> eyre::Result<CommandOutput> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| eyre!("empty command"))?;

    let mut cmd = tokio::process::Command::new(program);

    for arg in args {
        let arg = vars.iter().fold(arg.clone(), |arg, (name, value)| {
            arg.replace(&format!("{{{name}}}"), value)
        });
        cmd.arg(arg);
    }

    for (name, value) in vars {
        cmd.env(format!("CERTSYNC_{}", name.to_ascii_uppercase()), value);
    }

    log::debug!("Run command: {argv:?}");

    let output = cmd
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .wrap_err_with(|| format!("failed to run {program}"))?;

    Ok(CommandOutput {
        success: output.status.success(),
        code: output.status.code(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|arg| (*arg).to_owned()).collect()
    }

    #[tokio::test]
    async fn test_placeholders_and_env() {
        let script = r#"test "$1" = a.conf && test "$CERTSYNC_CONFIG" = a.conf"#;
        let out = run(
            &argv(&["sh", "-c", script, "sh", "{config}"]),
            &[("config", "a.conf")],
        )
        .await
        .unwrap();

        assert!(out.success, "{}", out.describe());
    }

    #[tokio::test]
    async fn test_failure_output() {
        let out = run(&argv(&["sh", "-c", "echo broken >&2; exit 3"]), &[])
            .await
            .unwrap();

        assert!(!out.success);
        assert_eq!(out.code, Some(3));
        assert_eq!(out.describe(), "exit code 3: broken");
    }

    #[tokio::test]
    async fn test_missing_program() {
        assert!(run(&argv(&["/nonexistent/certsync-test"]), &[]).await.is_err());
        assert!(run(&[], &[]).await.is_err());
    }
}
