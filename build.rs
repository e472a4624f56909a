use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Build output and the vendored reference pack are never scanned.
const SKIPPED_DIRS: [&str; 2] = ["./target", "./examples"];

// Source directories whose edits should re-run the policy scan.
const WATCHED_DIRS: [&str; 5] = ["stack", "models", "cli", "tests", "benches"];

const FORBIDDEN_WORDS: [&str; 14] = [
    "FIXED",
    "CORRECTED",
    "FIX",
    "FIXES",
    "NEW",
    "CHANGED",
    "CHANGES",
    "CHANGE",
    "MODIFIED",
    "MODIFIES",
    "MODIFY",
    "UPDATED",
    "UPDATES",
    "UPDATE",
];

// One source policy rule. Each rule pairs a line regex with a check on the
// matched line that decides whether it is a real violation.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Rule {
    UnderscorePrefix,
    ForbiddenWord,
    DoubleStar,
    AllCaps,
    AllowDeadCode,
}

impl Rule {
    const ALL: [Rule; 5] = [
        Rule::UnderscorePrefix,
        Rule::ForbiddenWord,
        Rule::DoubleStar,
        Rule::AllCaps,
        Rule::AllowDeadCode,
    ];

    fn pattern(self) -> String {
        match self {
            Rule::UnderscorePrefix => r"\b(_[a-zA-Z0-9_]+)\b".to_string(),
            Rule::ForbiddenWord => format!(r"(//|/\*|///).*(?:{})", FORBIDDEN_WORDS.join("|")),
            Rule::DoubleStar => r"(//|/\*).*\*\*".to_string(),
            Rule::AllCaps => r"(//|/\*|///).*".to_string(),
            Rule::AllowDeadCode => r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]".to_string(),
        }
    }

    // The build script spells out the forbidden words, so only the
    // identifier rule applies to it.
    fn scans_build_script(self) -> bool {
        self == Rule::UnderscorePrefix
    }

    fn is_violation(self, line: &str) -> bool {
        match self {
            Rule::UnderscorePrefix => !is_comment_line(line) && !underscore_in_string(line),
            Rule::ForbiddenWord | Rule::AllowDeadCode => true,
            Rule::DoubleStar => {
                !is_doc_comment(line) || FORBIDDEN_WORDS.iter().any(|word| line.contains(word))
            }
            Rule::AllCaps => comment_text(line).is_some_and(|text| {
                let letters: Vec<char> = text.chars().filter(|c| c.is_alphabetic()).collect();
                !letters.is_empty() && letters.iter().all(|c| c.is_uppercase())
            }),
        }
    }

    fn explanation(self) -> &'static str {
        match self {
            Rule::UnderscorePrefix => {
                "Underscore-prefixed names are not allowed in this project.\n   Either use the variable (removing the underscore) or remove it completely."
            }
            Rule::ForbiddenWord => {
                "Comments narrating edits ('FIXED', 'CHANGED', 'UPDATE', ...) are STRICTLY FORBIDDEN in this project.\n   Remove them completely rather than commenting them out."
            }
            Rule::DoubleStar => {
                "The '**' pattern is not allowed in regular comments (but is allowed in /// doc comments)."
            }
            Rule::AllCaps => {
                "Comments where all alphabetic characters are uppercase are STRICTLY FORBIDDEN in this project."
            }
            Rule::AllowDeadCode => {
                "#[allow(dead_code)] attributes are STRICTLY FORBIDDEN in this project.\n   Either use the code (removing the attribute) or remove it completely."
            }
        }
    }
}

fn is_doc_comment(line: &str) -> bool {
    line.trim_start().starts_with("///")
}

fn is_comment_line(line: &str) -> bool {
    line.trim_start().starts_with("//")
        || (line.contains("/*") && !line.contains("*/match") && !line.contains("*/let"))
}

// True when an underscore appears between a pair of double quotes.
fn underscore_in_string(line: &str) -> bool {
    line.split('"')
        .enumerate()
        .any(|(index, part)| index % 2 == 1 && part.contains('_'))
}

// The text of a line comment or of the first block comment on the line.
fn comment_text(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if let Some(rest) = trimmed.strip_prefix("///") {
        Some(rest.trim())
    } else if let Some(rest) = trimmed.strip_prefix("//") {
        Some(rest.trim())
    } else if let Some(start) = line.find("/*") {
        let body = &line[start + 2..];
        Some(match body.find("*/") {
            Some(end) => body[..end].trim(),
            None => body.trim(),
        })
    } else {
        None
    }
}

// Collects the violating lines of one file for one rule.
struct RuleCollector {
    rule: Rule,
    violations: Vec<String>,
}

impl Sink for RuleCollector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        if self.rule.is_violation(line_text) {
            self.violations.push(format!("{line_number}:{line_text}"));
        }
        Ok(true)
    }
}

fn rust_sources(include_build_script: bool) -> impl Iterator<Item = PathBuf> {
    WalkDir::new(".")
        .into_iter()
        .filter_entry(|entry| !SKIPPED_DIRS.iter().any(|dir| entry.path() == Path::new(dir)))
        .filter_map(|entry| entry.ok())
        .filter(move |entry| include_build_script || entry.file_name() != "build.rs")
        .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "rs"))
        .map(|entry| entry.into_path())
}

fn scan(rule: Rule) -> Result<(), Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(&rule.pattern())?;
    let mut searcher = Searcher::new();

    for path in rust_sources(rule.scans_build_script()) {
        if std::fs::read_to_string(&path).is_err() {
            continue;
        }
        let mut collector = RuleCollector {
            rule,
            violations: Vec::new(),
        };
        searcher.search_path(&matcher, &path, &mut collector)?;

        if !collector.violations.is_empty() {
            let mut message = format!(
                "\n❌ ERROR: Found {} source policy violations in {}:\n",
                collector.violations.len(),
                path.display()
            );
            for violation in &collector.violations {
                message.push_str(&format!("   {violation}\n"));
            }
            message.push_str(&format!("\n⚠️ {}\n", rule.explanation()));
            return Err(message.into());
        }
    }
    Ok(())
}

// Compiles build.rs on its own with the project's strict lints denied.
fn check_build_script_lints() {
    let Some(out_dir) = std::env::var_os("OUT_DIR") else {
        println!("cargo:warning=OUT_DIR is not set; skipping the build script lint check");
        return;
    };
    let output = std::process::Command::new("rustc")
        .args([
            "--edition",
            "2024",
            "-D",
            "unused_variables",
            "-D",
            "dead_code",
            "-D",
            "unused_imports",
            "--crate-type",
            "bin",
            "--emit",
            "metadata",
            "--error-format",
            "human",
        ])
        .arg("--out-dir")
        .arg(&out_dir)
        .arg("build.rs")
        .output();

    match output {
        Ok(output) if !output.status.success() => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let problem = if stderr.contains("unused variable") {
                Some("Unused variables")
            } else if stderr.contains("is never used") {
                Some("Unused functions")
            } else if stderr.contains("unused import") {
                Some("Unused imports")
            } else {
                None
            };
            if let Some(problem) = problem {
                eprintln!("\n❌ ERROR: {problem} detected in build.rs!");
                eprintln!("{stderr}");
                eprintln!("\n⚠️ {problem} are STRICTLY FORBIDDEN in this project.");
                std::process::exit(1);
            }
        }
        Ok(_) => {}
        Err(_) => {
            println!(
                "cargo:warning=Could not check for unused variables/functions/imports in build.rs"
            );
        }
    }
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for dir in WATCHED_DIRS {
        println!("cargo:rerun-if-changed={dir}");
    }

    check_build_script_lints();

    for rule in Rule::ALL {
        if let Err(e) = scan(rule) {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}
