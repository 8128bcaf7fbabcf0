//! Compiler profiles
//!
//! A profile is a compiler program plus an argument template. Profiles are
//! read from `files/compilers.toml` (embedded at build time) and optionally
//! from an extra TOML file that may override or add entries.

use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::Context;
use serde::Deserialize;
use tracing::{debug, error};

use crate::core::JobError;

const INPUTS: &str = "{inputs}";
const OUTPUT: &str = "{output}";

/// A compiler program and its argument template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilerProfile {
    pub name: String,
    pub program: String,
    /// May contain the `{inputs}` entry and `{output}` placeholders
    pub args: Vec<String>,
}

impl CompilerProfile {
    pub fn new(name: impl Into<String>, program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    fn needs_inputs(&self) -> bool {
        self.args.iter().any(|a| a == INPUTS)
    }

    fn needs_output(&self) -> bool {
        self.args.iter().any(|a| a.contains(OUTPUT))
    }

    /// Fill in the template.
    ///
    /// Returns the program and its final argument list.
    pub fn build_cmdline(
        &self,
        inputs: &[String],
        output: Option<&str>,
    ) -> Result<(String, Vec<String>), JobError> {
        if self.needs_inputs() && inputs.is_empty() {
            return Err(JobError::InvalidConfiguration(format!(
                "Compiler profile '{}' needs input files, but none were given",
                self.name
            )));
        }

        let output = match output {
            Some(output) => output,
            None if self.needs_output() => {
                return Err(JobError::InvalidConfiguration(format!(
                    "Compiler profile '{}' needs an output file name",
                    self.name
                )))
            }
            None => "",
        };

        let mut args = Vec::with_capacity(self.args.len() + inputs.len());
        for arg in &self.args {
            if arg == INPUTS {
                args.extend(inputs.iter().cloned());
            } else {
                args.push(arg.replace(OUTPUT, output));
            }
        }

        debug!("Compiler command line: {} {:?}", self.program, args);
        Ok((self.program.clone(), args))
    }
}

/// Free-function form of [`CompilerProfile::build_cmdline`]
pub fn build_cmdline(
    profile: &CompilerProfile,
    inputs: &[String],
    output: Option<&str>,
) -> Result<(String, Vec<String>), JobError> {
    profile.build_cmdline(inputs, output)
}

#[derive(Debug, Deserialize)]
struct RawProfile {
    command: String,
    #[serde(default)]
    aliases: Vec<String>,
}

static PROFILES: OnceLock<HashMap<String, CompilerProfile>> = OnceLock::new();

fn builtin_source() -> &'static str {
    include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/files/compilers.toml"))
}

/// Parse a profile table; keys are lowercased, aliases point at the same profile
pub fn parse_profiles(content: &str) -> anyhow::Result<HashMap<String, CompilerProfile>> {
    let raw: HashMap<String, RawProfile> =
        toml::from_str(content).context("Failed to parse compiler profiles")?;

    let mut profiles = HashMap::new();
    for (name, raw) in raw {
        let mut parts = raw.command.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .with_context(|| format!("Empty command for compiler profile {}", name))?;
        let profile = CompilerProfile {
            name: name.clone(),
            program,
            args: parts.collect(),
        };

        for alias in &raw.aliases {
            profiles.insert(alias.to_lowercase(), profile.clone());
        }
        profiles.insert(name.to_lowercase(), profile);
    }

    Ok(profiles)
}

/// Initialize the profile table, merging `extra` over the built-in profiles
pub fn init_profiles(extra: Option<&Path>) -> anyhow::Result<()> {
    let mut profiles = parse_profiles(builtin_source())?;

    if let Some(path) = extra {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read compiler profiles from {:?}", path))?;
        profiles.extend(parse_profiles(&content)?);
    }

    PROFILES
        .set(profiles)
        .map_err(|_| anyhow::anyhow!("Compiler profiles already initialized"))?;

    Ok(())
}

fn profiles() -> &'static HashMap<String, CompilerProfile> {
    PROFILES.get_or_init(|| {
        parse_profiles(builtin_source()).unwrap_or_else(|e| {
            error!("Built-in compiler profiles are unusable: {:#}", e);
            HashMap::new()
        })
    })
}

/// Look up a profile by name or alias
pub fn get_profile(name: &str) -> Option<CompilerProfile> {
    profiles().get(&name.trim().to_lowercase()).cloned()
}

/// All profile names and aliases, sorted
pub fn supported_profiles() -> Vec<String> {
    let mut names: Vec<String> = profiles().keys().cloned().collect();
    names.sort();
    names
}
