//! Harness description reported by the guest and the initial test case
//! synthesized from it.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::domain::models::test_case::{TestCase, TestCaseElement};

/// Element name used for a concolic standard input stream.
pub const STDIN_ELEMENT: &str = "concolic-stdin";

/// Suffix of the POSIX-model copy of a file or stdin element.
pub const POSIX_SUFFIX: &str = "-posix";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarnessArgument {
    pub index: u32,
    pub size: usize,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub concolic: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarnessFile {
    pub path: String,
    pub size: usize,
    #[serde(default)]
    pub data: Vec<u8>,
    #[serde(default)]
    pub concolic: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarnessStdin {
    pub size: usize,
    #[serde(default)]
    pub data: Vec<u8>,
    #[serde(default)]
    pub concolic: bool,
}

/// Guest-side harness configuration shared with the dispatcher once per
/// target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestData {
    #[serde(default)]
    pub executable: String,
    #[serde(default)]
    pub arguments: Vec<HarnessArgument>,
    #[serde(default)]
    pub files: Vec<HarnessFile>,
    #[serde(default)]
    pub stdin: Option<HarnessStdin>,
}

impl GuestData {
    /// Build the first test case of a target: one element per concolic
    /// argument, file and stdin stream, padded with zeros to its declared size.
    pub fn initial_test_case(&self) -> TestCase {
        let mut elements = Vec::new();

        for arg in self.arguments.iter().filter(|a| a.concolic) {
            elements.push(TestCaseElement::new(
                format!("argv_{}", arg.index),
                fit(arg.value.as_bytes(), arg.size),
            ));
        }

        for file in self.files.iter().filter(|f| f.concolic) {
            let name = file_name(&file.path);
            let data = fit(&file.data, file.size);
            elements.push(TestCaseElement::new(name, data.clone()));
            elements.push(TestCaseElement::new(format!("{name}{POSIX_SUFFIX}"), data));
        }

        if let Some(stdin) = self.stdin.as_ref().filter(|s| s.concolic) {
            let data = fit(&stdin.data, stdin.size);
            elements.push(TestCaseElement::new(STDIN_ELEMENT, data.clone()));
            elements.push(TestCaseElement::new(
                format!("{STDIN_ELEMENT}{POSIX_SUFFIX}"),
                data,
            ));
        }

        if elements.is_empty() {
            warn!(executable = %self.executable, "harness declares no concolic inputs; initial test case is empty");
        }

        TestCase::new(elements)
    }
}

fn fit(data: &[u8], size: usize) -> Vec<u8> {
    if size == 0 {
        return data.to_vec();
    }
    let mut buf = vec![0u8; size];
    let n = data.len().min(size);
    buf[..n].copy_from_slice(&data[..n]);
    buf
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arguments_padded_to_size() {
        let guest = GuestData {
            arguments: vec![
                HarnessArgument {
                    index: 1,
                    size: 4,
                    value: "ab".into(),
                    concolic: true,
                },
                HarnessArgument {
                    index: 2,
                    size: 4,
                    value: "fixed".into(),
                    concolic: false,
                },
            ],
            ..GuestData::default()
        };
        let tc = guest.initial_test_case();
        assert_eq!(tc.elements().len(), 1);
        assert_eq!(tc.element("argv_1").unwrap().data, b"ab\0\0");
    }

    #[test]
    fn test_files_and_stdin_get_posix_copies() {
        let guest = GuestData {
            files: vec![HarnessFile {
                path: "/tmp/input.txt".into(),
                size: 3,
                data: b"hello".to_vec(),
                concolic: true,
            }],
            stdin: Some(HarnessStdin {
                size: 2,
                data: vec![],
                concolic: true,
            }),
            ..GuestData::default()
        };
        let tc = guest.initial_test_case();
        let names: Vec<_> = tc.elements().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "input.txt",
                "input.txt-posix",
                "concolic-stdin",
                "concolic-stdin-posix"
            ]
        );
        assert_eq!(tc.element("input.txt").unwrap().data, b"hel");
        assert_eq!(tc.element("concolic-stdin").unwrap().data, vec![0, 0]);
    }

    #[test]
    fn test_no_concolic_inputs_gives_empty_case() {
        assert!(GuestData::default().initial_test_case().is_empty());
    }
}
