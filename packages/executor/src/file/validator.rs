// ABOUTME: Structural validation of submitted source files before they reach an environment
// ABOUTME: Size and extension limits, blocked/suspicious pattern scans, and a complexity heuristic

use super::{FileError, Result};
use crate::config::ValidationConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

const SUSPICIOUS_PATTERNS: [&str; 12] = [
    "http://",
    "ftp://",
    "file://",
    "os.Open",
    "ioutil.ReadFile",
    "os.ReadFile",
    "exec.",
    "syscall.",
    "runtime.",
    "unsafe.",
    "reflect.",
    "cgo.",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub complexity: f64,
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self {
            is_valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
            complexity: 0.0,
        }
    }
}

impl ValidationResult {
    fn reject(&mut self, message: String) {
        self.is_valid = false;
        self.errors.push(message);
    }
}

#[derive(Debug, Clone)]
pub struct CodeValidator {
    config: ValidationConfig,
}

impl CodeValidator {
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }

    /// Validate a file on disk: size, extension, content patterns, complexity
    pub async fn validate_file(&self, path: &Path) -> Result<ValidationResult> {
        let content = tokio::fs::read(path)
            .await
            .map_err(|source| FileError::io(format!("failed to read {}", path.display()), source))?;

        let mut result = ValidationResult::default();
        if content.len() as u64 > self.config.max_file_size {
            result.reject(format!("file size exceeds limit: {} bytes", content.len()));
        }

        let ext = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| format!(".{}", ext))
            .unwrap_or_default();
        if !self.config.allowed_extensions.iter().any(|allowed| *allowed == ext) {
            result.reject(format!("file extension not allowed: {}", ext));
        }

        self.scan_content(&String::from_utf8_lossy(&content), &mut result);
        debug!(
            "Validated {} (valid: {}, complexity: {:.2})",
            path.display(),
            result.is_valid,
            result.complexity
        );
        Ok(result)
    }

    /// Validate in-memory source. Extension is not checked.
    pub fn validate_content(&self, content: &[u8]) -> ValidationResult {
        let mut result = ValidationResult::default();
        if content.len() as u64 > self.config.max_file_size {
            result.reject(format!("file size exceeds limit: {} bytes", content.len()));
            return result;
        }

        self.scan_content(&String::from_utf8_lossy(content), &mut result);
        result
    }

    fn scan_content(&self, content: &str, result: &mut ValidationResult) {
        for (index, line) in content.lines().enumerate() {
            let line_number = index + 1;

            for pattern in &self.config.blocked_patterns {
                if line.contains(pattern.as_str()) {
                    result.reject(format!(
                        "dangerous pattern found at line {}: {}",
                        line_number, pattern
                    ));
                }
            }

            for pattern in SUSPICIOUS_PATTERNS {
                if line.contains(pattern) {
                    result.warnings.push(format!(
                        "suspicious pattern at line {}: {}",
                        line_number, pattern
                    ));
                }
            }
        }

        result.complexity = calculate_complexity(content);
        if self.config.max_complexity > 0.0 && result.complexity > self.config.max_complexity {
            result.warnings.push(format!(
                "code complexity {:.2} exceeds limit {:.2}",
                result.complexity, self.config.max_complexity
            ));
        }
    }
}

/// Weighted count of size, lines, functions, imports, and control flow keywords
pub fn calculate_complexity(content: &str) -> f64 {
    let size_kb = content.len() as f64 / 1024.0;
    let lines = content.split('\n').count() as f64;
    let functions = content.matches("func ").count() as f64;
    let imports = content.matches("import ").count() as f64;
    let loops = (content.matches("for ").count() + content.matches("range ").count()) as f64;
    let conditionals = (content.matches("if ").count() + content.matches("switch ").count()) as f64;

    size_kb * 0.1 + lines * 0.01 + functions * 0.5 + imports * 0.2 + (loops + conditionals) * 0.3
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn validator() -> CodeValidator {
        CodeValidator::new(ValidationConfig::default())
    }

    #[test]
    fn test_complexity_heuristic() {
        let source = "package main\nimport \"fmt\"\nfunc main() {\n  for i := range xs {\n    if i > 0 {}\n  }\n}";
        let expected = source.len() as f64 / 1024.0 * 0.1 + 7.0 * 0.01 + 0.5 + 0.2 + 3.0 * 0.3;
        assert!((calculate_complexity(source) - expected).abs() < 1e-9);
    }

    #[test]
    fn test_blocked_pattern_invalidates_with_line_number() {
        let result = validator().validate_content(b"package main\nfunc main() {\n  os.RemoveAll(\"/\")\n}");
        assert!(!result.is_valid);
        assert_eq!(
            result.errors,
            vec!["dangerous pattern found at line 3: os.RemoveAll".to_string()]
        );
    }

    #[test]
    fn test_suspicious_pattern_only_warns() {
        let result = validator().validate_content(b"resp = get('http://example.com')\n");
        assert!(result.is_valid);
        assert_eq!(
            result.warnings,
            vec!["suspicious pattern at line 1: http://".to_string()]
        );
    }

    #[test]
    fn test_oversized_content_rejected() {
        let mut config = ValidationConfig::default();
        config.max_file_size = 4;
        let result = CodeValidator::new(config).validate_content(b"print(1)");
        assert!(!result.is_valid);
        assert_eq!(result.errors, vec!["file size exceeds limit: 8 bytes".to_string()]);
    }

    #[test]
    fn test_complexity_limit_warns() {
        let mut config = ValidationConfig::default();
        config.max_complexity = 0.01;
        let result = CodeValidator::new(config).validate_content(b"if a:\n  pass\n");
        assert!(result.is_valid);
        assert!(result.warnings[0].starts_with("code complexity"));
    }

    #[tokio::test]
    async fn test_validate_file_checks_extension() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("script.rb");
        std::fs::write(&path, "puts 1").unwrap();

        let result = validator().validate_file(&path).await.unwrap();
        assert!(!result.is_valid);
        assert_eq!(result.errors, vec!["file extension not allowed: .rb".to_string()]);
    }

    #[tokio::test]
    async fn test_validate_file_accepts_clean_source() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("main.py");
        std::fs::write(&path, "print('hello')\n").unwrap();

        let result = validator().validate_file(&path).await.unwrap();
        assert!(result.is_valid);
        assert!(result.errors.is_empty());
        assert!(result.complexity > 0.0);
    }

    #[tokio::test]
    async fn test_validate_missing_file_is_error() {
        let dir = TempDir::new().unwrap();
        assert!(validator()
            .validate_file(&dir.path().join("missing.go"))
            .await
            .is_err());
    }
}
