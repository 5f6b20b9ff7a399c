//! Pre-execution static scan for generated code.
//!
//! The forbidden-pattern set covers the four classes the sandbox refuses to
//! run: arbitrary shell invocation, network sockets to non-loopback hosts,
//! filesystem writes outside the scratch directory, and native extension
//! loading. A match aborts execution before any user code runs.

use regex::Regex;

/// One scanner hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanFinding {
    pub label: &'static str,
    /// The offending line, trimmed, for the verdict report.
    pub excerpt: String,
}

struct ForbiddenPattern {
    regex: Regex,
    label: &'static str,
    /// Loopback-targeted network use is tolerated (local test servers).
    allow_loopback: bool,
}

/// Matches generated code against the forbidden-pattern set.
pub struct SecurityScanner {
    patterns: Vec<ForbiddenPattern>,
}

impl Default for SecurityScanner {
    fn default() -> Self {
        let spec: &[(&str, &str, bool)] = &[
            (
                r"(?i)\b(os\.system|subprocess\.(run|call|Popen|check_output)|popen|child_process|execSync|spawnSync|shell_exec)\b",
                "arbitrary shell invocation",
                false,
            ),
            (
                r#"(?i)\b(socket\.socket|socket\.connect|net\.connect|net\.Socket|http\.request|requests\.(get|post|put|delete)|urllib\.request|fetch\s*\(|curl\s+http)"#,
                "network socket",
                true,
            ),
            (
                r#"(?i)(open\s*\(\s*['"]/|os\.remove\s*\(\s*['"]/|shutil\.rmtree|fs\.(writeFile|unlink|rm)\w*\s*\(\s*['"]/|>\s*/etc/|>\s*/usr/)"#,
                "filesystem write outside scratch directory",
                false,
            ),
            (
                r#"(?i)\b(ctypes|cffi|dlopen|process\.dlopen|require\s*\(\s*['"]ffi)"#,
                "native extension loading",
                false,
            ),
        ];

        let patterns = spec
            .iter()
            .map(|(pattern, label, allow_loopback)| ForbiddenPattern {
                regex: Regex::new(pattern).expect("forbidden pattern must compile"),
                label,
                allow_loopback: *allow_loopback,
            })
            .collect();

        Self { patterns }
    }
}

impl SecurityScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scan code line by line. Returns every hit, in source order.
    pub fn scan(&self, code: &str) -> Vec<ScanFinding> {
        let mut findings = Vec::new();
        for line in code.lines() {
            let trimmed = line.trim();
            if trimmed.starts_with('#') || trimmed.starts_with("//") {
                continue;
            }
            for pattern in &self.patterns {
                if pattern.regex.is_match(line) {
                    if pattern.allow_loopback
                        && (line.contains("127.0.0.1") || line.contains("localhost"))
                    {
                        continue;
                    }
                    findings.push(ScanFinding {
                        label: pattern.label,
                        excerpt: truncate(trimmed, 120),
                    });
                }
            }
        }
        findings
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{cut}…")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_code_passes() {
        let scanner = SecurityScanner::new();
        let code = "def add(a, b):\n    return a + b\n\nprint(add(1, 2))\n";
        assert!(scanner.scan(code).is_empty());
    }

    #[test]
    fn test_shell_invocation_is_flagged() {
        let scanner = SecurityScanner::new();
        let code = "import os\nos.system('rm -rf /')\n";
        let findings = scanner.scan(code);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].label, "arbitrary shell invocation");
    }

    #[test]
    fn test_network_call_is_flagged() {
        let scanner = SecurityScanner::new();
        let code = "import requests\nresp = requests.get('https://evil.example.com')\n";
        let findings = scanner.scan(code);
        assert!(findings.iter().any(|f| f.label == "network socket"));
    }

    #[test]
    fn test_loopback_network_is_tolerated() {
        let scanner = SecurityScanner::new();
        let code = "resp = requests.get('http://127.0.0.1:8000/health')\n";
        assert!(scanner.scan(code).is_empty());
    }

    #[test]
    fn test_absolute_path_write_is_flagged() {
        let scanner = SecurityScanner::new();
        let code = "with open('/etc/passwd', 'w') as f:\n    f.write('x')\n";
        let findings = scanner.scan(code);
        assert!(
            findings
                .iter()
                .any(|f| f.label == "filesystem write outside scratch directory")
        );
    }

    #[test]
    fn test_native_extension_is_flagged() {
        let scanner = SecurityScanner::new();
        let code = "import ctypes\nlibc = ctypes.CDLL('libc.so.6')\n";
        let findings = scanner.scan(code);
        assert!(findings.iter().any(|f| f.label == "native extension loading"));
    }

    #[test]
    fn test_comment_lines_are_ignored() {
        let scanner = SecurityScanner::new();
        let code = "# os.system('harmless comment')\n// execSync in a comment\nx = 1\n";
        assert!(scanner.scan(code).is_empty());
    }

    #[test]
    fn test_multiple_findings_in_source_order() {
        let scanner = SecurityScanner::new();
        let code = "import ctypes\nos.system('ls')\n";
        let findings = scanner.scan(code);
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[0].label, "native extension loading");
        assert_eq!(findings[1].label, "arbitrary shell invocation");
    }
}
