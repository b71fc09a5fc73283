//! Immutable language registry.
//!
//! Populated once at startup and never mutated afterward. Indexed by
//! a short string tag so adapters can validate a caller-supplied language
//! name without reaching into the orchestrator's internals.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

/// Memory ceiling class for a language's sandbox container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum MemoryClass {
    /// 100 MiB — sufficient for most interpreters and small compiled binaries.
    Standard,
    /// 256 MiB — for runtimes whose idle footprint exceeds the standard cap.
    Heavy,
}

impl MemoryClass {
    pub fn bytes(self) -> u64 {
        match self {
            MemoryClass::Standard => 100 * 1024 * 1024,
            MemoryClass::Heavy => 256 * 1024 * 1024,
        }
    }
}

/// Immutable record describing how to compile/run one supported language.
#[derive(Debug, Clone)]
pub struct LanguageSpec {
    pub tag: &'static str,
    pub image: &'static str,
    pub source_filename: &'static str,
    pub run_command: Vec<String>,
    pub compile_run_command: Option<String>,
    pub memory_class: MemoryClass,
    stdin_detector: Regex,
}

impl LanguageSpec {
    /// Whether the submitted source looks like it reads standard input.
    pub fn detects_stdin(&self, source: &str) -> bool {
        self.stdin_detector.is_match(source)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NotFound {
    #[error("unknown language: {0}")]
    UnknownLanguage(String),
}

fn spec(
    tag: &'static str,
    image: &'static str,
    source_filename: &'static str,
    run_command: &[&'static str],
    compile_run_command: Option<&'static str>,
    memory_class: MemoryClass,
    stdin_pattern: &str,
) -> LanguageSpec {
    LanguageSpec {
        tag,
        image,
        source_filename,
        run_command: run_command.iter().map(|s| s.to_string()).collect(),
        compile_run_command: compile_run_command.map(str::to_string),
        memory_class,
        stdin_detector: Regex::new(&format!("(?i){stdin_pattern}"))
            .expect("stdin detector pattern is a compile-time constant"),
    }
}

fn build_table() -> HashMap<&'static str, LanguageSpec> {
    let specs = vec![
        spec(
            "python",
            "codecell/sandbox-python:latest",
            "script.py",
            &["python3", "script.py"],
            None,
            MemoryClass::Standard,
            r"input\(",
        ),
        spec(
            "javascript",
            "codecell/sandbox-node:latest",
            "script.js",
            &["node", "script.js"],
            None,
            MemoryClass::Standard,
            r"readline|process\.stdin",
        ),
        spec(
            "ruby",
            "codecell/sandbox-ruby:latest",
            "script.rb",
            &["ruby", "script.rb"],
            None,
            MemoryClass::Standard,
            r"gets|readline",
        ),
        spec(
            "cpp",
            "codecell/sandbox-cpp:latest",
            "main.cpp",
            &["/tmp/build/a.out"],
            Some("mkdir -p /tmp/build && g++ -O2 -o /tmp/build/a.out main.cpp"),
            MemoryClass::Standard,
            r"cin|getline|scanf",
        ),
        spec(
            "go",
            "codecell/sandbox-go:latest",
            "main.go",
            &["go", "run", "main.go"],
            None,
            MemoryClass::Standard,
            r"\bScan\b|ReadString",
        ),
        spec(
            "java",
            "codecell/sandbox-java:latest",
            "Main.java",
            &["java", "-cp", "/tmp/build", "Main"],
            Some("mkdir -p /tmp/build && javac -d /tmp/build Main.java"),
            MemoryClass::Heavy,
            r"Scanner|BufferedReader",
        ),
    ];

    specs.into_iter().map(|s| (s.tag, s)).collect()
}

/// The immutable mapping from language tag to `LanguageSpec`.
pub struct Registry {
    table: HashMap<&'static str, LanguageSpec>,
}

impl Registry {
    pub fn new() -> Self {
        Self { table: build_table() }
    }

    /// Shared process-wide instance; the table is built once and never
    /// mutated (mirrors the `OnceLock`-backed lazy singletons the gateway
    /// uses for its executor and room manager).
    pub fn global() -> &'static Registry {
        static REGISTRY: OnceLock<Registry> = OnceLock::new();
        REGISTRY.get_or_init(Registry::new)
    }

    pub fn lookup(&self, tag: &str) -> Result<&LanguageSpec, NotFound> {
        self.table
            .get(tag)
            .ok_or_else(|| NotFound::UnknownLanguage(tag.to_string()))
    }

    pub fn list(&self) -> Vec<&'static str> {
        let mut tags: Vec<_> = self.table.keys().copied().collect();
        tags.sort_unstable();
        tags
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
