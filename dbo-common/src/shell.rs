//! Remote command assembly and log masking.
//!
//! Everything the daemon interpolates into a shell line (paths, directories,
//! log lines) is quoted here. Raw user commands are passed through as
//! written; users own their own quoting.

use std::borrow::Cow;

/// Quote a value for a POSIX shell.
pub fn quote(value: &str) -> String {
    shell_escape::unix::escape(Cow::from(value)).into_owned()
}

/// Wrap a command so it runs inside `cwd`.
pub fn with_cwd(cwd: &str, command: &str) -> String {
    format!("cd {} && {}", quote(cwd), command)
}

/// True when the command's first token is the change-directory verb.
pub fn is_cd_command(command: &str) -> bool {
    let trimmed = command.trim_start();
    trimmed == "cd" || trimmed.starts_with("cd ") || trimmed.starts_with("cd\t")
}

/// Append a pwd probe so the shell reports where a directory change landed.
pub fn with_pwd_probe(command: &str) -> String {
    format!("{} && pwd", command)
}

/// Build an injection-safe append of one line to a remote file.
pub fn append_line(path: &str, line: &str) -> String {
    format!("printf '%s\\n' {} >> {}", quote(line), quote(path))
}

/// Build a tail of the last `lines` lines of a remote file. Missing files
/// read as empty rather than failing.
pub fn tail_file(path: &str, lines: u32) -> String {
    format!("tail -n {} {} 2>/dev/null || true", lines, quote(path))
}

fn find_value_end(s: &str) -> usize {
    let mut end = 0;
    let mut in_quote = None;
    let mut escaped = false;

    for c in s.chars() {
        let char_len = c.len_utf8();

        if escaped {
            escaped = false;
            end += char_len;
            continue;
        }

        if c == '\\' {
            escaped = true;
            end += char_len;
            continue;
        }

        if let Some(q) = in_quote {
            if c == q {
                in_quote = None;
            }
            end += char_len;
            continue;
        }

        if c == '"' || c == '\'' {
            in_quote = Some(c);
            end += char_len;
            continue;
        }

        if c.is_whitespace() {
            break;
        }

        end += char_len;
    }
    end
}

/// Mask sensitive values in a command string before it is logged or
/// mirrored to the remote command-log file.
pub fn mask_secrets(cmd: &str) -> String {
    // The value part is replaced with "***" while the key/flag is kept.
    let patterns = [
        ("PASSWORD=", "PASSWORD=***"),
        ("PASSPHRASE=", "PASSPHRASE=***"),
        ("SECRET=", "SECRET=***"),
        ("TOKEN=", "TOKEN=***"),
        ("API_KEY=", "API_KEY=***"),
        ("ACCESS_KEY=", "ACCESS_KEY=***"),
        ("PRIVATE_KEY=", "PRIVATE_KEY=***"),
        ("--password ", "--password ***"),
        ("--password=", "--password=***"),
        ("--token ", "--token ***"),
        ("--token=", "--token=***"),
        ("--secret ", "--secret ***"),
        ("--secret=", "--secret=***"),
    ];

    let mut result = cmd.to_string();
    for (pattern, replacement) in patterns {
        // Track search position to avoid re-matching the replacement,
        // which contains the pattern.
        let mut search_start = 0;
        while search_start < result.len() {
            let Some(start) = result[search_start..].find(pattern) else {
                break;
            };
            let abs_start = search_start + start;
            let value_start = abs_start + pattern.len();

            let rest = &result[value_start..];
            let value_end = value_start + find_value_end(rest);

            let prefix = &result[..abs_start];
            let suffix = &result[value_end..];
            result = format!("{}{}{}", prefix, replacement, suffix);

            search_start = abs_start + replacement.len();
        }
    }

    result
}
