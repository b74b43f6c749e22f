use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, ensure};
use serde::Deserialize;

/// How a program case is expected to end.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CaseClass {
    /// Every form compiles and runs.
    RuntimeSuccess,
    /// Some forms are rejected by the parser or the code generator; the
    /// session reports them and carries on.
    RecoverableError,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BenchConfig {
    pub enabled: bool,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExpectedOutcome {
    pub exit_code: i32,
    pub stdout_file: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CaseSpec {
    pub class: CaseClass,
    pub bench: BenchConfig,
    pub expected: ExpectedOutcome,
}

/// A directory under `tests/programs` holding `case.yaml`, `program.ks` and
/// the expected output.
#[derive(Debug, Clone)]
pub struct Case {
    pub name: String,
    pub dir: PathBuf,
    pub spec: CaseSpec,
}

impl Case {
    pub fn read_text(&self, relative_path: &str) -> Result<String> {
        let path = self.dir.join(relative_path);
        fs::read_to_string(&path).with_context(|| format!("Reading {}", path.display()))
    }

    pub fn source(&self) -> Result<String> {
        self.read_text("program.ks")
    }
}

/// Every case directory under `programs_dir`, in name order. Directories
/// without a `case.yaml` are ignored.
pub fn load_cases(programs_dir: &Path) -> Result<Vec<Case>> {
    let entries =
        fs::read_dir(programs_dir).with_context(|| format!("Reading {}", programs_dir.display()))?;

    let mut cases = Vec::new();
    for entry in entries {
        let dir = entry?.path();
        let case_path = dir.join("case.yaml");
        if !case_path.is_file() {
            continue;
        }

        let name = dir
            .file_name()
            .and_then(|value| value.to_str())
            .map(str::to_string)
            .with_context(|| format!("Invalid case directory name {}", dir.display()))?;
        let raw = fs::read_to_string(&case_path)
            .with_context(|| format!("Reading {}", case_path.display()))?;
        let spec = serde_yaml::from_str(&raw)
            .with_context(|| format!("Parsing {}", case_path.display()))?;
        cases.push(Case { name, dir, spec });
    }

    ensure!(!cases.is_empty(), "No cases found in {}", programs_dir.display());
    cases.sort_by(|left, right| left.name.cmp(&right.name));
    Ok(cases)
}

/// Cases marked for benchmarking, in name order.
pub fn bench_cases(programs_dir: &Path) -> Result<Vec<Case>> {
    let cases = load_cases(programs_dir)?;
    Ok(cases
        .into_iter()
        .filter(|case| case.spec.bench.enabled)
        .collect())
}

pub fn normalize_output(output: &str) -> String {
    output.replace("\r\n", "\n").trim_end().to_string()
}
