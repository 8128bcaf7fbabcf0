//! Step-script validator
//!
//! Interprets the `[[step]]` list of the entry point in order. The first
//! failing step ends validation; `pass` and `fail` send their result and stop.
//!
//! ```toml
//! [[step]]
//! action = "prepare"
//!
//! [[step]]
//! action = "compile"
//! compiler = "gcc"
//! inputs = ["calc.c"]
//! output = "calc"
//!
//! [[step]]
//! action = "interact"
//! program = "./calc"
//! exchange = [{ expect = "> " }, { send = "1 + 2" }, { expect = "3" }]
//!
//! [[step]]
//! action = "run"
//! program = "./calc"
//! args = ["--selftest"]
//! expect_file = "selftest.out"
//! ```

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use super::{search_path, Validator};
use crate::compiler::{get_profile, CompilerProfile};
use crate::config::get_config;
use crate::core::{JobError, DEFAULT_FAIL_TUTOR};
use crate::job::ValidationJob;
use crate::runner::Pattern;

fn yes() -> bool {
    true
}

fn default_compiler() -> String {
    "gcc".to_string()
}

/// One line sent to the program
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendLine {
    pub send: String,
}

/// Output the program must print next
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExpectOutput {
    pub expect: String,
    #[serde(default)]
    pub regex: bool,
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Exchange {
    Send(SendLine),
    Expect(ExpectOutput),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Step {
    Prepare {
        #[serde(default = "yes")]
        remove_directories: bool,
        #[serde(default)]
        recode: bool,
    },
    EnsureFiles {
        files: Vec<String>,
    },
    Configure {
        #[serde(default = "yes")]
        mandatory: bool,
        timeout: Option<u64>,
    },
    Make {
        #[serde(default = "yes")]
        mandatory: bool,
        timeout: Option<u64>,
    },
    Compile {
        #[serde(default = "default_compiler")]
        compiler: String,
        inputs: Vec<String>,
        output: Option<String>,
        timeout: Option<u64>,
    },
    Build {
        #[serde(default = "default_compiler")]
        compiler: String,
        inputs: Vec<String>,
        output: Option<String>,
        timeout: Option<u64>,
    },
    Run {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        /// Lines sent to the program right after the start
        #[serde(default)]
        input: Vec<String>,
        exit_status: Option<i32>,
        /// Substrings the output must contain
        #[serde(default)]
        expect: Vec<String>,
        /// File shipped with the validator holding the exact expected output
        expect_file: Option<String>,
        timeout: Option<u64>,
    },
    Interact {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        exchange: Vec<Exchange>,
        exit_status: Option<i32>,
        encoding: Option<String>,
        timeout: Option<u64>,
    },
    Grep {
        pattern: String,
        /// Fail if the pattern is found instead of if it is missing
        #[serde(default)]
        forbid: bool,
        student: Option<String>,
        tutor: Option<String>,
    },
    Pass {
        student: String,
        tutor: Option<String>,
    },
    Fail {
        student: String,
        tutor: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
struct ScriptConfig {
    #[serde(default, rename = "step")]
    steps: Vec<Step>,
}

/// Whether validation goes on after a step
enum Flow {
    Continue,
    Stop,
}

#[derive(Debug, Clone)]
pub struct ScriptValidator {
    steps: Vec<Step>,
}

impl ScriptValidator {
    pub fn new(steps: Vec<Step>) -> Self {
        Self { steps }
    }

    /// Parse the entry point parameters. Unknown compilers are rejected here.
    pub fn from_table(params: &toml::Table) -> anyhow::Result<Self> {
        let config: ScriptConfig = toml::Value::Table(params.clone())
            .try_into()
            .context("Invalid validator script")?;

        for step in &config.steps {
            if let Step::Compile { compiler, .. } | Step::Build { compiler, .. } = step {
                if get_profile(compiler).is_none() {
                    anyhow::bail!("Unknown compiler profile '{}'", compiler);
                }
            }
        }

        Ok(Self::new(config.steps))
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }
}

fn compile_timeout(secs: Option<u64>) -> Duration {
    secs.map(Duration::from_secs)
        .unwrap_or(get_config().compile_timeout)
}

fn run_timeout(secs: Option<u64>) -> Duration {
    secs.map(Duration::from_secs)
        .unwrap_or(get_config().run_timeout)
}

fn profile(name: &str) -> Result<CompilerProfile, JobError> {
    get_profile(name)
        .ok_or_else(|| JobError::InvalidConfiguration(format!("unknown compiler profile '{}'", name)))
}

fn normalize(text: &str) -> String {
    text.replace("\r\n", "\n").trim().to_string()
}

#[async_trait]
impl Validator for ScriptValidator {
    async fn validate(&self, job: &mut ValidationJob) -> Result<(), JobError> {
        for (index, step) in self.steps.iter().enumerate() {
            debug!("Running step {}: {:?}", index + 1, step);
            if let Flow::Stop = run_step(step, job).await? {
                break;
            }
        }
        Ok(())
    }
}

async fn run_step(step: &Step, job: &mut ValidationJob) -> Result<Flow, JobError> {
    match step {
        Step::Prepare {
            remove_directories,
            recode,
        } => job.prepare_student_files(*remove_directories, *recode)?,
        Step::EnsureFiles { files } => {
            for name in files {
                if !job.ensure_files(&[name.as_str()])? {
                    return Err(JobError::FileNotFound(name.clone()));
                }
            }
        }
        Step::Configure { mandatory, timeout } => {
            job.run_configure(*mandatory, compile_timeout(*timeout))
                .await?
        }
        Step::Make { mandatory, timeout } => {
            job.run_make(*mandatory, compile_timeout(*timeout)).await?
        }
        Step::Compile {
            compiler,
            inputs,
            output,
            timeout,
        } => {
            job.run_compiler(
                &profile(compiler)?,
                inputs,
                output.as_deref(),
                compile_timeout(*timeout),
            )
            .await?;
        }
        Step::Build {
            compiler,
            inputs,
            output,
            timeout,
        } => {
            job.run_build(
                &profile(compiler)?,
                inputs,
                output.as_deref(),
                compile_timeout(*timeout),
            )
            .await?;
        }
        Step::Run {
            program,
            args,
            input,
            exit_status,
            expect,
            expect_file,
            timeout,
        } => {
            let mut running = job.spawn_program(program, args, run_timeout(*timeout), None)?;
            for line in input {
                running.send_line(line).await?;
            }
            let output = match exit_status {
                Some(code) => running.expect_exit_status(*code).await?,
                None => running.wait_for_end().await?.1,
            };

            for needle in expect {
                if !output.contains(needle.as_str()) {
                    return Err(JobError::custom(
                        format!(
                            "The output of '{}' does not contain the expected text '{}'.\n\nOutput:\n{}",
                            program, needle, output
                        ),
                        format!("Expected '{}' in output of '{}'", needle, program),
                    ));
                }
            }

            if let Some(name) = expect_file {
                let path = search_path::resolve(name)
                    .ok_or_else(|| JobError::InvalidConfiguration(format!(
                        "expected output file '{}' is not shipped with the validator",
                        name
                    )))?;
                let expected = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read {:?}", path))?;
                if normalize(&expected) != normalize(&output) {
                    return Err(JobError::custom(
                        format!(
                            "The output of '{}' is not as expected.\n\nOutput:\n{}",
                            program, output
                        ),
                        format!("Output of '{}' differs from {}", program, name),
                    ));
                }
            }
        }
        Step::Interact {
            program,
            args,
            exchange,
            exit_status,
            encoding,
            timeout,
        } => {
            let mut running = job.spawn_program(
                program,
                args,
                run_timeout(*timeout),
                encoding.as_deref(),
            )?;
            for item in exchange {
                match item {
                    Exchange::Send(SendLine { send }) => running.send_line(send).await?,
                    Exchange::Expect(ExpectOutput {
                        expect,
                        regex,
                        timeout,
                    }) => {
                        let pattern = if *regex {
                            Pattern::regex(expect.as_str())
                        } else {
                            Pattern::literal(expect.as_str())
                        };
                        running
                            .expect_output(pattern, timeout.map(Duration::from_secs))
                            .await?;
                    }
                }
            }
            if let Some(code) = exit_status {
                running.expect_exit_status(*code).await?;
            }
        }
        Step::Grep {
            pattern,
            forbid,
            student,
            tutor,
        } => {
            let found = job.grep(pattern)?;
            if *forbid && !found.is_empty() {
                return Err(JobError::custom(
                    student
                        .clone()
                        .unwrap_or_else(|| "Your submission contains forbidden content.".to_string()),
                    tutor
                        .clone()
                        .unwrap_or_else(|| format!("Pattern '{}' found in {}", pattern, found.join(", "))),
                ));
            }
            if !*forbid && found.is_empty() {
                return Err(JobError::custom(
                    student
                        .clone()
                        .unwrap_or_else(|| "Your submission lacks required content.".to_string()),
                    tutor
                        .clone()
                        .unwrap_or_else(|| format!("Pattern '{}' not found", pattern)),
                ));
            }
        }
        Step::Pass { student, tutor } => {
            info!("Script sends pass result");
            job.send_pass_result(student.as_str(), tutor.as_deref().unwrap_or(student))
                .await;
            return Ok(Flow::Stop);
        }
        Step::Fail { student, tutor } => {
            info!("Script sends fail result");
            job.send_fail_result(student.as_str(), tutor.as_deref().unwrap_or(DEFAULT_FAIL_TUTOR))
                .await;
            return Ok(Flow::Stop);
        }
    }
    Ok(Flow::Continue)
}
