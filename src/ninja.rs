//! Ninja build-description output
//!
//! A line-oriented writer for the Ninja grammar plus the command-list
//! emitter: one synthesized rule and one build edge per command. The writer
//! keeps pool / implicit / order-only support for extensibility even though
//! the trace pipeline passes empty collections for them.

use crate::model::Command;

/// Escape Ninja metacharacters in a path token.
///
/// An existing `"$ "` sequence becomes `"$$ "`; a bare space becomes `"$ "`;
/// a colon becomes `"$:"`. Single scan, so the space step never re-escapes a
/// `$` inserted by an earlier rule.
pub fn escape_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut chars = path.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '$' if chars.peek() == Some(&' ') => {
                chars.next();
                out.push_str("$$ ");
            }
            ' ' => out.push_str("$ "),
            ':' => out.push_str("$:"),
            _ => out.push(c),
        }
    }
    out
}

/// Optional rule variables beyond `command`.
#[derive(Debug, Default)]
pub struct RuleOptions<'a> {
    pub description: Option<&'a str>,
    pub depfile: Option<&'a str>,
    pub generator: bool,
    pub pool: Option<&'a str>,
    pub restat: bool,
    pub rspfile: Option<&'a str>,
    pub rspfile_content: Option<&'a str>,
    pub deps: Option<&'a str>,
}

/// Accumulates Ninja syntax into a string.
#[derive(Debug, Default)]
pub struct NinjaWriter {
    out: String,
}

impl NinjaWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn line(&mut self, text: &str, indent: usize) {
        for _ in 0..indent {
            self.out.push(' ');
        }
        self.out.push_str(text);
        self.out.push('\n');
    }

    pub fn newline(&mut self) {
        self.out.push('\n');
    }

    pub fn comment(&mut self, text: &str) {
        self.out.push_str("# ");
        self.out.push_str(text);
        self.out.push('\n');
    }

    pub fn variable(&mut self, key: &str, value: &str, indent: usize) {
        self.line(&format!("{key} = {value}"), indent);
    }

    pub fn pool(&mut self, name: &str, depth: usize) {
        self.line(&format!("pool {name}"), 0);
        self.variable("depth", &depth.to_string(), 1);
    }

    pub fn rule(&mut self, name: &str, command: &str, options: &RuleOptions) {
        self.line(&format!("rule {name}"), 0);
        self.variable("command", command, 1);
        if let Some(description) = options.description {
            self.variable("description", description, 1);
        }
        if let Some(depfile) = options.depfile {
            self.variable("depfile", depfile, 1);
        }
        if options.generator {
            self.variable("generator", "1", 1);
        }
        if let Some(pool) = options.pool {
            self.variable("pool", pool, 1);
        }
        if options.restat {
            self.variable("restat", "1", 1);
        }
        if let Some(rspfile) = options.rspfile {
            self.variable("rspfile", rspfile, 1);
        }
        if let Some(rspfile_content) = options.rspfile_content {
            self.variable("rspfile_content", rspfile_content, 1);
        }
        if let Some(deps) = options.deps {
            self.variable("deps", deps, 1);
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn build(
        &mut self,
        outputs: &[String],
        rule: &str,
        inputs: &[String],
        implicit_inputs: &[String],
        order_only_inputs: &[String],
        variables: &[(String, String)],
        implicit_outputs: &[String],
        pool: Option<&str>,
    ) {
        let mut out_tokens: Vec<String> = outputs.iter().map(|p| escape_path(p)).collect();
        let mut in_tokens: Vec<String> = inputs.iter().map(|p| escape_path(p)).collect();

        if !implicit_inputs.is_empty() {
            in_tokens.push("|".to_string());
            in_tokens.extend(implicit_inputs.iter().map(|p| escape_path(p)));
        }
        if !order_only_inputs.is_empty() {
            in_tokens.push("||".to_string());
            in_tokens.extend(order_only_inputs.iter().map(|p| escape_path(p)));
        }
        if !implicit_outputs.is_empty() {
            out_tokens.push("|".to_string());
            out_tokens.extend(implicit_outputs.iter().map(|p| escape_path(p)));
        }

        self.line(
            &format!("build {}: {rule} {}", out_tokens.join(" "), in_tokens.join(" ")),
            0,
        );
        if let Some(pool) = pool {
            self.variable("pool", pool, 1);
        }
        for (key, value) in variables {
            self.variable(key, value, 1);
        }
    }

    pub fn include(&mut self, path: &str) {
        self.line(&format!("include {path}"), 0);
    }

    pub fn subninja(&mut self, path: &str) {
        self.line(&format!("subninja {path}"), 0);
    }

    pub fn defaults(&mut self, targets: &[String]) {
        self.line(&format!("default {}", targets.join(" ")), 0);
    }

    pub fn into_string(self) -> String {
        self.out
    }
}

/// Emit one rule and one build edge for a command under the given rule name.
pub fn command_to_rule(writer: &mut NinjaWriter, command: &Command, name: &str) {
    let options = match &command.rsp_file {
        // Declare the response-file mechanism so the build executor
        // regenerates the argument file the command line references.
        Some(rsp) => RuleOptions {
            rspfile: Some(&rsp.file_name),
            rspfile_content: Some(&rsp.contents),
            ..RuleOptions::default()
        },
        None => RuleOptions::default(),
    };
    writer.rule(name, &command.command_line, &options);
    writer.build(
        &command.file_writes,
        name,
        &command.file_reads,
        &[],
        &[],
        &[],
        &[],
        None,
    );
    writer.newline();
}

/// Render the whole command list as a Ninja document, rule names `r0`, `r1`,
/// ... in list order.
pub fn commands_to_ninja(commands: &[Command]) -> String {
    let mut writer = NinjaWriter::new();
    for (idx, command) in commands.iter().enumerate() {
        command_to_rule(&mut writer, command, &format!("r{idx}"));
    }
    writer.into_string()
}
