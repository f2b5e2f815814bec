//! Prompt construction for the environment-building agent.

use std::fmt::Write as _;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use crate::EXIT_CODE_MARKER;
use crate::instance::Instance;

/// Heredoc delimiter the eval script must use when inlining the test patch.
pub const PATCH_HEREDOC_DELIMITER: &str = "EOF_114329324912";

/// Tools the agent may use without prompting.
pub const ALLOWED_TOOLS: &[&str] = &[
    "Bash",
    "Read",
    "Write",
    "Edit",
    "Glob",
    "Grep",
    "NotebookEdit",
    "WebFetch",
    "WebSearch",
    "TodoWrite",
    "BashOutput",
    "KillBash",
];

/// Language assumed when no test file has a recognised extension.
pub const DEFAULT_LANGUAGE: &str = "python";

const LANGUAGE_BY_EXTENSION: &[(&str, &str)] = &[
    ("py", "python"),
    ("js", "javascript"),
    ("jsx", "javascript"),
    ("ts", "typescript"),
    ("tsx", "typescript"),
    ("java", "java"),
    ("go", "go"),
    ("rs", "rust"),
    ("rb", "ruby"),
    ("php", "php"),
    ("c", "c"),
    ("h", "c"),
    ("cpp", "cpp"),
    ("hpp", "cpp"),
    ("cs", "csharp"),
    ("swift", "swift"),
    ("kt", "kotlin"),
    ("scala", "scala"),
];

static SOURCE_FILE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^--- a/(.+?)\s*$").expect("static regex"));

/// Lines every `setup_repo.sh` must contain, in this order.
pub const SETUP_REPO_REQUIREMENTS: &[&str] = &[
    "MUST start with `#!/bin/bash` and `set -uxo pipefail`",
    "MUST clone the repo: `git clone -o origin https://github.com/<repo> /testbed/`",
    "MUST set permissions: `chmod -R 777 /testbed/`",
    "MUST cd: `cd /testbed/`",
    "MUST reset: `git reset --hard <base_commit>`",
    "MUST remove origin: `git remote remove origin`",
    "Then install dependencies, test dependencies included, and build the project",
];

/// Lines every `eval_script` must contain.
pub const EVAL_SCRIPT_REQUIREMENTS: &[&str] = &[
    "MUST start with `#!/bin/bash`",
    "MUST include `set -uxo pipefail`",
    "MUST include `exec > >(tee -a /tmp/full.log) 2>&1`",
    "MUST include `git config --global --add safe.directory /testbed/`",
    "MUST cd to `/testbed/`",
    "MUST reset test files: `git checkout <base_commit> <test files, space separated>`",
    "MUST apply the test patch through a heredoc: `git apply --verbose --reject - <<'EOF_114329324912'`",
    "MUST wrap the test command in the markers `: '>>>>> Start Test Output'` and `: '>>>>> End Test Output'`",
    "MUST capture the exit code with `rc=$?` immediately after the test command",
    "MUST print `echo \"OMNIGRIL_EXIT_CODE=$rc\"`; the evaluation framework parses this exact string",
    "MUST reset the test files again at the end",
    "NEVER use parallel test flags: -n auto, --num-processes=auto, -p auto, -nauto",
    "Use -x for pytest to stop on the first failure",
];

/// Lines every `dockerfile` must contain.
pub const DOCKERFILE_REQUIREMENTS: &[&str] = &[
    "MUST use `FROM --platform=linux/x86_64 <base_image>`",
    "MUST include `COPY ./setup_repo.sh /root/`",
    "MUST include `RUN /bin/bash /root/setup_repo.sh`",
    "MUST include `WORKDIR /testbed/`",
    "Keep it minimal; all setup logic goes in setup_repo.sh",
];

fn bullets(lines: &[&str]) -> String {
    lines.iter().fold(String::new(), |mut acc, line| {
        let _ = writeln!(acc, "- {line}");
        acc
    })
}

pub fn system_prompt() -> String {
    format!(
        r#"You are a DevOps engineer who builds Docker environments for running a repository's test suite at a fixed commit.

## Phase 1: Analyze the repository
1. Check build and config files: setup.py, setup.cfg, pyproject.toml, package.json, pom.xml, Cargo.toml, go.mod, Makefile, tox.ini.
2. Read the CI configuration (.github/workflows/*.yml, .travis.yml, tox.ini, Makefile) to learn the official build and test process.
3. Use the test patch to identify the test files, the test framework and the test command.
4. Determine the language version, dependency tooling, and any system libraries or services needed.

## Phase 2: Generate the configuration

### setup_repo.sh
{setup_repo}
### eval_script
{eval_script}
### dockerfile
{dockerfile}
## Phase 3: Validate in Docker
1. `mkdir -p <build_dir>` and write `<build_dir>/Dockerfile` and `<build_dir>/setup_repo.sh`.
2. `cd <build_dir> && docker build -t test_<instance_id> .`; on failure fix the base image, system packages or install commands and rebuild.
3. Run the eval script in the container without the fix patch. `{marker}=` must report a non-zero code.
4. Run it again with the fix patch applied after the test patch. The tests must pass.
5. If any step fails, fix the configuration and repeat from step 2.
6. Clean up: `docker rmi test_<instance_id> 2>/dev/null || true` and `rm -rf <build_dir>`.

## Phase 4: Final answer
Reply with exactly one block of this form and nothing outside it:

<SHOVEL_OUTPUT_JSON>
```json
{{
  "dockerfile": "...",
  "eval_script": "...",
  "setup_scripts": {{"setup_repo.sh": "..."}}
}}
```
</SHOVEL_OUTPUT_JSON>

## Rules
- Prefer the simplest configuration that works, matching the project's CI as closely as possible.
- Include every system-level dependency (build-essential, libffi-dev, ...).
- Use the language version the project needs at this commit.
- Run the exact test files from the test patch.
- The heredoc delimiter for the test patch MUST be {delimiter}.
"#,
        setup_repo = bullets(SETUP_REPO_REQUIREMENTS),
        eval_script = bullets(EVAL_SCRIPT_REQUIREMENTS),
        dockerfile = bullets(DOCKERFILE_REQUIREMENTS),
        marker = EXIT_CODE_MARKER,
        delimiter = PATCH_HEREDOC_DELIMITER,
    )
}

/// Render the per-instance user prompt.
pub fn build_user_prompt(instance: &Instance, build_dir: &Path) -> String {
    let test_files = modified_files(&instance.test_patch);
    let language = detect_language(&test_files);

    let test_files_list = if test_files.is_empty() {
        "- (none detected)".to_string()
    } else {
        test_files.iter().fold(String::new(), |mut acc, f| {
            if !acc.is_empty() {
                acc.push('\n');
            }
            let _ = write!(acc, "- `{f}`");
            acc
        })
    };

    format!(
        r#"## Task
Build and validate a Docker test environment for this repository.

## Repository
- Repository: {repo}
- Instance ID: {instance_id}
- Base commit: {base_commit}
- Language: {language} (detected from test files)

## Problem statement
{problem_statement}

## Test patch (apply inside eval_script)
```diff
{test_patch}
```

## Test files
{test_files_list}

## Fix patch (apply after the test patch to confirm the tests pass)
```diff
{patch}
```

## Steps
1. Inspect the repository in the current working directory.
2. Write the Dockerfile and setup_repo.sh to {build_dir}/ and `docker build` it.
3. `docker run` the eval script: the tests must FAIL.
4. `docker run` the eval script with the fix patch applied: the tests must PASS.
5. Fix and retry on any failure, then remove the test image and {build_dir}.
6. Emit the final configuration.

Remember:
- eval_script MUST contain `echo "{marker}=$rc"`
- the Dockerfile MUST use `FROM --platform=linux/x86_64`
- the heredoc delimiter MUST be {delimiter}
- wrap the final answer in <SHOVEL_OUTPUT_JSON> ... </SHOVEL_OUTPUT_JSON>
"#,
        repo = instance.repo,
        instance_id = instance.instance_id,
        base_commit = instance.base_commit,
        problem_statement = instance.problem_statement,
        test_patch = instance.test_patch,
        patch = instance.patch,
        build_dir = build_dir.display(),
        marker = EXIT_CODE_MARKER,
        delimiter = PATCH_HEREDOC_DELIMITER,
    )
}

/// Source paths (`--- a/...`) touched by a unified diff, in order.
pub fn modified_files(patch: &str) -> Vec<String> {
    let mut files: Vec<String> = Vec::new();
    for caps in SOURCE_FILE_RE.captures_iter(patch) {
        let path = caps[1].to_string();
        if !files.contains(&path) {
            files.push(path);
        }
    }
    files
}

/// Most common language among `files`; ties go to the first seen.
pub fn detect_language(files: &[String]) -> &'static str {
    let mut counts: Vec<(&'static str, usize)> = Vec::new();
    for file in files {
        let Some(ext) = Path::new(file).extension().and_then(|e| e.to_str()) else {
            continue;
        };
        let ext = ext.to_ascii_lowercase();
        let Some(&(_, lang)) = LANGUAGE_BY_EXTENSION.iter().find(|(e, _)| *e == ext) else {
            continue;
        };
        match counts.iter_mut().find(|(l, _)| *l == lang) {
            Some((_, n)) => *n += 1,
            None => counts.push((lang, 1)),
        }
    }

    let mut best: Option<(&'static str, usize)> = None;
    for (lang, n) in counts {
        if best.is_none_or(|(_, b)| n > b) {
            best = Some((lang, n));
        }
    }
    best.map_or(DEFAULT_LANGUAGE, |(lang, _)| lang)
}
