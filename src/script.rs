//! Build and run script generation.

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

/// One line (or block) of a generated script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Comment(String),
    Command(String),
    /// Ordered `export NAME=value` assignments.
    EnvChange(Vec<(String, String)>),
    ModuleChange(String),
    Newline,
}

impl Directive {
    fn render(&self) -> String {
        match self {
            Directive::Comment(text) => text
                .lines()
                .map(|l| format!("# {}\n", l.trim_start_matches('#').trim_start()))
                .collect(),
            Directive::Command(cmd) => format!("{}\n", cmd),
            Directive::EnvChange(vars) => vars
                .iter()
                .map(|(k, v)| format!("export {}=\"{}\"\n", k, v))
                .collect(),
            Directive::ModuleChange(module) => format!("{}\n", module_command(module)),
            Directive::Newline => "\n".to_string(),
        }
    }
}

/// `name` loads, `-name` unloads, `old->new` swaps.
fn module_command(module: &str) -> String {
    if let Some(name) = module.strip_prefix('-') {
        format!("module unload {}", name)
    } else if let Some((old, new)) = module.split_once("->") {
        format!("module swap {} {}", old.trim(), new.trim())
    } else {
        format!("module load {}", module)
    }
}

/// Accumulates directives and writes them out as an executable script.
pub struct ScriptComposer {
    path: PathBuf,
    directives: Vec<Directive>,
}

impl ScriptComposer {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            directives: Vec::new(),
        }
    }

    pub fn comment(&mut self, text: impl Into<String>) -> &mut Self {
        self.directives.push(Directive::Comment(text.into()));
        self
    }

    pub fn command(&mut self, cmd: impl Into<String>) -> &mut Self {
        self.directives.push(Directive::Command(cmd.into()));
        self
    }

    pub fn env_change(&mut self, vars: Vec<(String, String)>) -> &mut Self {
        self.directives.push(Directive::EnvChange(vars));
        self
    }

    pub fn module_change(&mut self, module: impl Into<String>) -> &mut Self {
        self.directives.push(Directive::ModuleChange(module.into()));
        self
    }

    pub fn newline(&mut self) -> &mut Self {
        self.directives.push(Directive::Newline);
        self
    }

    pub fn render(&self) -> String {
        let mut out = String::from("#!/bin/bash\n\n");
        for d in &self.directives {
            out.push_str(&d.render());
        }
        out
    }

    pub fn write(&self) -> Result<()> {
        std::fs::write(&self.path, self.render())
            .with_context(|| format!("Failed to write script {}", self.path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o770))
                .with_context(|| format!("Failed to make {} executable", self.path.display()))?;
        }
        Ok(())
    }
}

fn truthy(section: &Map<String, Value>, key: &str) -> bool {
    match section.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

fn string_list(section: &Map<String, Value>, key: &str) -> Vec<String> {
    match section.get(key) {
        Some(Value::Array(items)) => items.iter().map(scalar_to_string).collect(),
        Some(Value::Null) | None => Vec::new(),
        Some(other) => vec![scalar_to_string(other)],
    }
}

fn scalar_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Lay out a build or run script from its config section.
///
/// Order: verbose echo, `TEST_ID`, preamble, modules, env, verbose dumps,
/// then the commands.
pub fn compose_from_section(path: &Path, section: &Map<String, Value>) -> ScriptComposer {
    let mut script = ScriptComposer::new(path);
    let verbose = truthy(section, "verbose");

    if verbose {
        script.comment("Echoing all commands to log.");
        script.command("set -v");
        script.newline();
    }

    script.comment("The first (and only) argument of the script is the test id.");
    script.env_change(vec![("TEST_ID".to_string(), "${1:-0}".to_string())]);

    let preamble = string_list(section, "preamble");
    if !preamble.is_empty() {
        script.newline();
        script.comment("Preamble commands");
        for cmd in preamble {
            script.command(cmd);
        }
    }

    let modules = string_list(section, "modules");
    if !modules.is_empty() {
        script.newline();
        script.comment("Perform module related changes to the environment.");
        for module in modules {
            script.module_change(module);
        }
    }

    if let Some(Value::Object(env)) = section.get("env")
        && !env.is_empty()
    {
        script.newline();
        script.comment("Making any environment changes needed.");
        script.env_change(
            env.iter()
                .map(|(k, v)| (k.clone(), scalar_to_string(v)))
                .collect(),
        );
    }

    if verbose {
        script.newline();
        script.comment("List all the modules for posterity");
        script.command("module -t list");
        script.newline();
        script.comment("Output the environment for posterity");
        script.command("declare -p");
    }

    script.newline();
    let cmds = string_list(section, "cmds");
    if cmds.is_empty() {
        script.comment("No commands given for this script.");
    } else {
        script.comment("Perform the sequence of test commands.");
        for line in &cmds {
            for split in line.split('\n') {
                script.command(split);
            }
        }
    }

    script
}
