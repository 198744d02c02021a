// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;

use crate::error::PostProcessError;

/// Values available to a user command template
#[derive(Debug, Clone, Copy)]
pub struct ExecContext<'a> {
    /// Final path of the episode file
    pub episode_path: &'a Path,
    /// Directory the episode was written to
    pub base_path: &'a Path,
    pub url: &'a str,
}

impl ExecContext<'_> {
    fn filename(&self) -> String {
        self.episode_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    fn filename_base(&self) -> String {
        let filename = self.filename();
        match filename.rfind('.') {
            Some(dot) => filename[..dot].to_string(),
            None => filename,
        }
    }
}

/// Quote a value for the platform shell
#[cfg(not(windows))]
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Quote a value for the platform shell
#[cfg(windows)]
pub fn shell_quote(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\\\""))
}

/// Replace every `{{episode_*}}` and `{{url}}` placeholder with its quoted value
pub fn substitute_exec(template: &str, context: &ExecContext<'_>) -> String {
    let path = context.episode_path.to_string_lossy();
    let base = context.base_path.to_string_lossy();

    // Longer names first so `{{episode_path}}` never eats `{{episode_path_base}}`
    template
        .replace("{{episode_path_base}}", &shell_quote(&base))
        .replace("{{episode_path}}", &shell_quote(&path))
        .replace("{{episode_filename_base}}", &shell_quote(&context.filename_base()))
        .replace("{{episode_filename}}", &shell_quote(&context.filename()))
        .replace("{{url}}", &shell_quote(context.url))
}

/// Run a user command through the platform shell with output discarded
pub async fn run_exec(template: &str, context: &ExecContext<'_>) -> Result<(), PostProcessError> {
    let command = substitute_exec(template, context);
    tracing::debug!(command = %command, "running exec");

    #[cfg(windows)]
    let (shell, flag) = ("cmd", "/C");
    #[cfg(not(windows))]
    let (shell, flag) = ("sh", "-c");

    let status = Command::new(shell)
        .args([flag, command.as_str()])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map_err(|e| PostProcessError::SpawnFailed {
            program: shell.to_string(),
            source: e,
        })?;

    if !status.success() {
        return Err(PostProcessError::ExitStatus {
            program: command,
            code: status.code(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn context<'a>(path: &'a Path, base: &'a Path) -> ExecContext<'a> {
        ExecContext {
            episode_path: path,
            base_path: base,
            url: "https://example.com/ep.mp3?x=1&y=2",
        }
    }

    #[cfg(not(windows))]
    #[test]
    fn substitutes_quoted_values() {
        let path = Path::new("/pods/Show/20240115-It's live.mp3");
        let base = Path::new("/pods/Show");

        let command = substitute_exec(
            "echo {{episode_path}} {{episode_path_base}} {{episode_filename}} {{episode_filename_base}} {{url}}",
            &context(path, base),
        );

        assert_eq!(
            command,
            r"echo '/pods/Show/20240115-It'\''s live.mp3' '/pods/Show' '20240115-It'\''s live.mp3' '20240115-It'\''s live' 'https://example.com/ep.mp3?x=1&y=2'"
        );
    }

    #[test]
    fn unknown_placeholders_are_left_alone() {
        let path = Path::new("ep.mp3");
        let command = substitute_exec("echo {{title}}", &context(path, Path::new(".")));
        assert_eq!(command, "echo {{title}}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn successful_command_sees_the_episode() {
        let dir = tempdir().unwrap();
        let episode = dir.path().join("ep one.mp3");
        std::fs::write(&episode, b"audio").unwrap();

        run_exec(
            "cp {{episode_path}} {{episode_path_base}}/copy.mp3",
            &context(&episode, dir.path()),
        )
        .await
        .unwrap();

        assert_eq!(std::fs::read(dir.path().join("copy.mp3")).unwrap(), b"audio");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_is_an_error() {
        let dir = tempdir().unwrap();
        let episode = dir.path().join("ep.mp3");

        let result = run_exec("exit 3", &context(&episode, dir.path())).await;

        assert!(matches!(
            result,
            Err(PostProcessError::ExitStatus { code: Some(3), .. })
        ));
    }
}
