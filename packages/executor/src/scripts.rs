// ABOUTME: Per-language shell scripts run inside execution environments
// ABOUTME: Initialization, warm-up setup, sentinel-wrapped execution, and reset between runs

use crate::types::Language;

pub const WORK_DIR: &str = "/code";
pub const START_MARKER: &str = "START_EXECUTION";
pub const END_MARKER: &str = "END_EXECUTION";

/// Keeps a freshly created container alive so execs can be attached later
pub const KEEP_ALIVE_COMMAND: &str = "tail -f /dev/null";

pub fn initialization_script(language: Language) -> &'static str {
    match language {
        Language::Go => {
            r#"set -e
mkdir -p /code
cd /code
echo 'package main; import "fmt"; func main() { fmt.Println("init") }' > code.go
[ -f go.mod ] || go mod init code
echo "Go environment initialized"
"#
        }
        Language::Py => {
            r#"set -e
mkdir -p /code
cd /code
echo 'print("init")' > code.py
echo "Python environment initialized"
"#
        }
        Language::Js | Language::Node => {
            r#"set -e
mkdir -p /code
cd /code
echo 'console.log("init");' > code.js
echo "JavaScript environment initialized"
"#
        }
        Language::Ts => {
            r#"set -e
mkdir -p /code
cd /code
npm install -g typescript
echo 'console.log("init");' > code.ts
echo "TypeScript environment initialized"
"#
        }
    }
}

/// Runs before every execution. The warm-up half only happens once per environment.
pub fn setup_script(language: Language) -> &'static str {
    match language {
        Language::Go => {
            r#"set -e
cd /code
if [ ! -f /code/.warm ]; then
    echo 'package main; func main(){}' > warm.go
    GOFLAGS='-buildvcs=false -trimpath' go build -o /tmp/warm warm.go
    rm -f warm.go /tmp/warm
    touch /code/.warm
fi
go mod tidy
"#
        }
        Language::Py => {
            r#"set -e
cd /code
if [ ! -f /code/.warm ]; then
    echo 'import json, os, sys, time, datetime' > warm.py
    python -m py_compile warm.py
    rm -rf warm.py __pycache__
    touch /code/.warm
fi
if [ -f requirements.txt ]; then
    pip install -r requirements.txt
fi
"#
        }
        Language::Js | Language::Node => {
            r#"set -e
cd /code
if [ ! -f /code/.warm ]; then
    echo "require('fs'); require('path'); require('https'); require('crypto');" > warm.js
    node warm.js || true
    rm -f warm.js
    touch /code/.warm
fi
if [ -f package.json ]; then
    npm install
fi
"#
        }
        Language::Ts => {
            r#"set -e
cd /code
if [ ! -f /code/.warm ]; then
    echo 'const a: string = "warm";' > warm.ts
    tsc warm.ts
    rm -f warm.ts warm.js
    touch /code/.warm
fi
if [ -f package.json ]; then
    npm install
fi
"#
        }
    }
}

/// Wrap `run_command` between sentinels and exit with its status
pub fn execution_script(run_command: &str) -> String {
    format!(
        "cd {dir}\necho \"{start}\"\n{cmd} 2>&1\nstatus=$?\necho \"{end}\"\nexit $status\n",
        dir = WORK_DIR,
        start = START_MARKER,
        end = END_MARKER,
        cmd = run_command,
    )
}

/// Removes everything an execution may have left behind
pub fn cleanup_script(language: Language) -> &'static str {
    match language {
        Language::Go => {
            r#"cd /code
rm -f code.go result.json execution_complete.flag
rm -rf /tmp/go-build*
"#
        }
        Language::Py => {
            r#"cd /code
rm -f code.py result.json execution_complete.flag requirements.txt
rm -rf __pycache__
"#
        }
        Language::Js | Language::Node => {
            r#"cd /code
rm -f code.js result.json execution_complete.flag package.json package-lock.json
rm -rf node_modules
"#
        }
        Language::Ts => {
            r#"cd /code
rm -f code.ts code.js result.json execution_complete.flag package.json package-lock.json tsconfig.json
rm -rf node_modules dist
"#
        }
    }
}

pub fn verification_command(language: Language) -> &'static str {
    match language {
        Language::Go => "go version",
        Language::Py => "python --version",
        Language::Js | Language::Node => "node --version",
        Language::Ts => "tsc --version",
    }
}

/// Extract the program output printed between the sentinel markers.
///
/// Output without a start marker is returned trimmed and unchanged. A missing end
/// marker (the process was killed or crashed) keeps everything after the start marker.
pub fn extract_output(raw: &str) -> String {
    let mut collected = Vec::new();
    let mut inside = false;
    let mut saw_start = false;

    for line in raw.lines() {
        if line.contains(START_MARKER) {
            inside = true;
            saw_start = true;
            continue;
        }
        if line.contains(END_MARKER) {
            inside = false;
            continue;
        }
        if inside {
            collected.push(line);
        }
    }

    if !saw_start {
        return raw.trim().to_string();
    }

    collected.join("\n").trim().to_string()
}
