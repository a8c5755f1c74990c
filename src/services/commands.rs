use std::collections::HashMap;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use regex::Regex;
use thiserror::Error;
use walkdir::WalkDir;

const TOP_HELP: &str = "\
Available prompt commands:

/?     - show this help
/dir   - include files from a directory
/do    - run a conversation template
/file  - include a file
/image - attach an image
/url   - include a web page

Run a command with -h for its usage, e.g. \"/file -h\".";

const DIR_USAGE: &str = "\
usage: /dir <directory> <ext> [options]

Include every matching file under a directory, each in its own fenced
block, in sorted path order.

options:
  -d <depth>  maximum recursion depth (default 1)
  -e <ext>    additional file extension to match (repeatable)
  -x <path>   exclude a file, or a directory given a trailing \"/\" (repeatable)
  -n          echo the expanded prompt instead of sending it
  -h          show this help";

const DO_USAGE: &str = "\
usage: /do <template> [options]

Run a conversation template by name or title.

options:
  -v <name> <value>  bind a template variable (repeatable)
  -h                 show this help";

const FILE_USAGE: &str = "\
usage: /file <path> [options]

Include a file's text in a fenced block.

options:
  -n  echo the expanded prompt instead of sending it
  -h  show this help";

const IMAGE_USAGE: &str = "\
usage: /image <path> [options]

Attach an image to the prompt.

options:
  -h  show this help";

const URL_USAGE: &str = "\
usage: /url <url> [options]

Include a web page's content in a fenced block.

options:
  -n  echo the expanded prompt instead of sending it
  -h  show this help";

/// What a command line turned into in the prompt text.
const HELP_NOTICE: &str = "(showing help)";

pub fn top_help() -> &'static str {
    TOP_HELP
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("{path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("{url}: {source}")]
    Fetch { url: String, source: reqwest::Error },

    #[error("{url}: HTTP {status}")]
    FetchStatus { url: String, status: u16 },

    #[error("invalid URL {url}: {source}")]
    InvalidUrl {
        url: String,
        source: url::ParseError,
    },

    #[error("no files found in {dir} matching {extensions}")]
    NoFilesMatched { dir: String, extensions: String },

    #[error("only one /do command is allowed per prompt")]
    MultipleTemplateRuns,

    #[error("{0}")]
    Usage(String),
}

/// Out-of-band results accumulated while expanding one prompt. At most one
/// of `help` and `template_run` ends up set; `show` and `images` are
/// independent of both.
#[derive(Debug, Clone, Default)]
pub struct PromptFlags {
    pub help: Option<String>,
    pub show: bool,
    pub template_run: Option<TemplateRun>,
    pub images: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct TemplateRun {
    pub name: String,
    pub variables: HashMap<String, String>,
}

enum LineOutcome {
    Text(String),
    Help(String),
}

/// Expands the embedded command language in prompt text: lines starting
/// with a `/command` are replaced by their expansion, everything else
/// passes through untouched.
pub struct CommandProcessor {
    client: reqwest::Client,
    fence_re: Regex,
}

impl CommandProcessor {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            // Line-leading fence delimiters, any indentation
            fence_re: Regex::new(r"(?m)^([ \t]*)(`{3,})").expect("fence pattern compiles"),
        }
    }

    /// Expand `prompt`, returning the rewritten text and the control flags
    /// the commands raised. Help short-circuits the rest of the prompt.
    pub async fn expand(&self, prompt: &str) -> Result<(String, PromptFlags), CommandError> {
        let mut flags = PromptFlags::default();
        let mut out: Vec<String> = Vec::new();

        for line in prompt.lines() {
            match self.expand_line(line, &mut flags).await? {
                LineOutcome::Text(text) => out.push(text),
                LineOutcome::Help(help) => {
                    flags.help = Some(help);
                    // Help supersedes a /do seen earlier in the prompt
                    flags.template_run = None;
                    out.push(HELP_NOTICE.to_string());
                    break;
                }
            }
        }

        Ok((out.join("\n"), flags))
    }

    async fn expand_line(
        &self,
        line: &str,
        flags: &mut PromptFlags,
    ) -> Result<LineOutcome, CommandError> {
        let Some(rest) = line.strip_prefix('/') else {
            return Ok(LineOutcome::Text(line.to_string()));
        };

        let tokens = split_command_line(rest);
        let Some((name, args)) = tokens.split_first() else {
            return Ok(LineOutcome::Text(line.to_string()));
        };
        if name != "?" && !is_command_word(name) {
            // Something like "/usr/bin/ls", not a command attempt
            return Ok(LineOutcome::Text(line.to_string()));
        }

        // -h outranks everything else on the line
        if args.iter().any(|a| a == "-h") {
            return Ok(LineOutcome::Help(usage_for(name).to_string()));
        }

        match name.as_str() {
            "?" => Ok(LineOutcome::Help(TOP_HELP.to_string())),
            "dir" => self.expand_dir(args, flags).await,
            "do" => expand_do(args, flags),
            "file" => self.expand_file(args, flags).await,
            "image" => expand_image(args, flags).await,
            "url" => self.expand_url(args, flags).await,
            _ => Ok(LineOutcome::Help(TOP_HELP.to_string())),
        }
    }

    async fn expand_file(
        &self,
        args: &[String],
        flags: &mut PromptFlags,
    ) -> Result<LineOutcome, CommandError> {
        let mut path: Option<&str> = None;
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "-n" => flags.show = true,
                other if is_option(other) => {
                    return Err(usage_error(&format!("unknown option {other}"), FILE_USAGE));
                }
                other => {
                    if path.replace(other).is_some() {
                        return Err(usage_error("too many arguments", FILE_USAGE));
                    }
                }
            }
        }
        let path = path.ok_or_else(|| usage_error("missing file path", FILE_USAGE))?;

        let text = read_text(path).await?;
        Ok(LineOutcome::Text(self.fenced_block(path, &text)))
    }

    async fn expand_dir(
        &self,
        args: &[String],
        flags: &mut PromptFlags,
    ) -> Result<LineOutcome, CommandError> {
        let mut positional: Vec<&str> = Vec::new();
        let mut depth = 1usize;
        let mut extra_extensions: Vec<String> = Vec::new();
        let mut excludes: Vec<String> = Vec::new();

        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "-n" => flags.show = true,
                "-d" => {
                    let value = iter
                        .next()
                        .ok_or_else(|| usage_error("-d requires a depth", DIR_USAGE))?;
                    depth = value
                        .parse()
                        .map_err(|_| usage_error(&format!("invalid depth '{value}'"), DIR_USAGE))?;
                }
                "-e" => {
                    let value = iter
                        .next()
                        .ok_or_else(|| usage_error("-e requires an extension", DIR_USAGE))?;
                    extra_extensions.push(normalize_extension(value));
                }
                "-x" => {
                    let value = iter
                        .next()
                        .ok_or_else(|| usage_error("-x requires a path", DIR_USAGE))?;
                    excludes.push(value.clone());
                }
                other if is_option(other) => {
                    return Err(usage_error(&format!("unknown option {other}"), DIR_USAGE));
                }
                other => positional.push(other),
            }
        }

        let &[dir, extension] = positional.as_slice() else {
            return Err(usage_error(
                "expected a directory and an extension",
                DIR_USAGE,
            ));
        };

        let mut extensions = vec![normalize_extension(extension)];
        extensions.append(&mut extra_extensions);

        let files = collect_dir_files(dir, &extensions, depth, &excludes)?;

        let mut blocks = Vec::new();
        for path in files {
            let text = read_text(&path.display().to_string()).await?;
            blocks.push(self.fenced_block(&path.display().to_string(), &text));
        }
        Ok(LineOutcome::Text(blocks.join("\n")))
    }

    async fn expand_url(
        &self,
        args: &[String],
        flags: &mut PromptFlags,
    ) -> Result<LineOutcome, CommandError> {
        let mut raw: Option<&str> = None;
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "-n" => flags.show = true,
                other if is_option(other) => {
                    return Err(usage_error(&format!("unknown option {other}"), URL_USAGE));
                }
                other => {
                    if raw.replace(other).is_some() {
                        return Err(usage_error("too many arguments", URL_USAGE));
                    }
                }
            }
        }
        let raw = raw.ok_or_else(|| usage_error("missing URL", URL_USAGE))?;

        let parsed = url::Url::parse(raw).map_err(|source| CommandError::InvalidUrl {
            url: raw.to_string(),
            source,
        })?;

        let response = self
            .client
            .get(parsed)
            .send()
            .await
            .map_err(|source| CommandError::Fetch {
                url: raw.to_string(),
                source,
            })?;

        if !response.status().is_success() {
            return Err(CommandError::FetchStatus {
                url: raw.to_string(),
                status: response.status().as_u16(),
            });
        }

        let body = response.text().await.map_err(|source| CommandError::Fetch {
            url: raw.to_string(),
            source,
        })?;

        Ok(LineOutcome::Text(self.fenced_block(raw, &body)))
    }

    /// Wrap content in a fenced block titled with its origin. Fence
    /// delimiters already inside the content are escaped so they cannot
    /// close the wrapper early.
    fn fenced_block(&self, title: &str, content: &str) -> String {
        let mut body = self.fence_re.replace_all(content, "$1\\$2").into_owned();
        if !body.ends_with('\n') {
            body.push('\n');
        }
        format!("**{title}**\n\n```\n{body}```\n")
    }
}

fn expand_do(args: &[String], flags: &mut PromptFlags) -> Result<LineOutcome, CommandError> {
    let mut name: Option<String> = None;
    let mut variables: HashMap<String, String> = HashMap::new();

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-v" => {
                let key = iter
                    .next()
                    .ok_or_else(|| usage_error("-v requires a name and a value", DO_USAGE))?;
                let value = iter
                    .next()
                    .ok_or_else(|| usage_error("-v requires a name and a value", DO_USAGE))?;
                variables.insert(key.clone(), value.clone());
            }
            other if is_option(other) => {
                return Err(usage_error(&format!("unknown option {other}"), DO_USAGE));
            }
            other => {
                if name.replace(other.to_string()).is_some() {
                    return Err(usage_error("too many arguments", DO_USAGE));
                }
            }
        }
    }
    let name = name.ok_or_else(|| usage_error("missing template name", DO_USAGE))?;

    if flags.template_run.is_some() {
        return Err(CommandError::MultipleTemplateRuns);
    }
    flags.template_run = Some(TemplateRun { name, variables });

    // The directive carries no content of its own
    Ok(LineOutcome::Text(String::new()))
}

async fn expand_image(args: &[String], flags: &mut PromptFlags) -> Result<LineOutcome, CommandError> {
    let mut path: Option<&str> = None;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            other if is_option(other) => {
                return Err(usage_error(&format!("unknown option {other}"), IMAGE_USAGE));
            }
            other => {
                if path.replace(other).is_some() {
                    return Err(usage_error("too many arguments", IMAGE_USAGE));
                }
            }
        }
    }
    let path = path.ok_or_else(|| usage_error("missing image path", IMAGE_USAGE))?;

    let bytes = tokio::fs::read(path)
        .await
        .map_err(|source| CommandError::Read {
            path: path.to_string(),
            source,
        })?;
    flags.images.push(BASE64.encode(bytes));

    Ok(LineOutcome::Text(String::new()))
}

async fn read_text(path: &str) -> Result<String, CommandError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|source| CommandError::Read {
            path: path.to_string(),
            source,
        })
}

fn collect_dir_files(
    dir: &str,
    extensions: &[String],
    depth: usize,
    excludes: &[String],
) -> Result<Vec<PathBuf>, CommandError> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).max_depth(depth) {
        let entry = entry.map_err(|source| CommandError::Read {
            path: dir.to_string(),
            source: source.into(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let name = path.to_string_lossy();
        if !extensions.iter().any(|ext| name.ends_with(ext.as_str())) {
            continue;
        }
        if is_excluded(path, excludes) {
            continue;
        }
        files.push(path.to_path_buf());
    }

    files.sort();
    if files.is_empty() {
        return Err(CommandError::NoFilesMatched {
            dir: dir.to_string(),
            extensions: extensions.join(", "),
        });
    }
    Ok(files)
}

fn is_excluded(path: &Path, excludes: &[String]) -> bool {
    excludes.iter().any(|exclude| {
        if let Some(prefix) = exclude.strip_suffix('/') {
            path.starts_with(prefix)
        } else {
            path == Path::new(exclude)
        }
    })
}

fn normalize_extension(extension: &str) -> String {
    if extension.starts_with('.') {
        extension.to_string()
    } else {
        format!(".{extension}")
    }
}

fn usage_for(command: &str) -> &'static str {
    match command {
        "dir" => DIR_USAGE,
        "do" => DO_USAGE,
        "file" => FILE_USAGE,
        "image" => IMAGE_USAGE,
        "url" => URL_USAGE,
        _ => TOP_HELP,
    }
}

fn is_option(token: &str) -> bool {
    token.len() > 1 && token.starts_with('-')
}

fn is_command_word(token: &str) -> bool {
    !token.is_empty()
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn usage_error(message: &str, usage: &str) -> CommandError {
    CommandError::Usage(format!("{message}\n{usage}"))
}

/// Split a command line into words, honoring double quotes so paths with
/// spaces stay together.
fn split_command_line(input: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for ch in input.chars() {
        match ch {
            '"' => in_quotes = !in_quotes,
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    parts.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        parts.push(current);
    }

    parts
}

/// Wrap text in a plain fenced block (used for help responses).
pub fn fenced(text: &str) -> String {
    let mut body = text.to_string();
    if !body.ends_with('\n') {
        body.push('\n');
    }
    format!("```\n{body}```")
}
