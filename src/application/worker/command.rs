//! Executors that run the configured VM and symbolic engine as local
//! processes.
//!
//! Argument templates understand `{input}`, `{trace_dir}`, `{image}`,
//! `{snapshot}`, `{arch}` and `{output}`.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use crate::application::worker::executor::{
    ConcreteExecutor, ImageSource, Session, SymbolicExecutor, TestBatch,
};
use crate::application::worker::process::ProcessSlot;
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::config::{SvmConfig, VmConfig};
use crate::domain::models::harness::GuestData;
use crate::domain::models::test_case::{load_test_dir, TestCase};
use crate::domain::models::trace::{TraceArtifact, BLOCK_SEQUENCE_FILE};
use crate::domain::models::worker::{ImageInfo, WorkerId};

const IMAGE_INFO_FILE: &str = "info.json";
const INPUT_FILE: &str = "input.bin";
const TRACE_OUT_DIR: &str = "trace-out";
const BITCODE_FILE: &str = "run.bc";
const TRANSLATOR_OUTPUT: &str = "dump_llvm_offline.bc";
const GENERATED_TESTS_DIR: &str = "tests";

/// Replace every `{name}` in `template` with its value.
pub fn substitute(template: &str, vars: &[(&str, &str)]) -> String {
    vars.iter().fold(template.to_string(), |acc, (name, value)| {
        acc.replace(&format!("{{{name}}}"), value)
    })
}

async fn remove_dir(path: &Path) -> DomainResult<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(DomainError::resource(path, e)),
    }
}

async fn recreate_dir(path: &Path) -> DomainResult<()> {
    remove_dir(path).await?;
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| DomainError::resource(path, e))
}

/// Copy the regular files at the top level of `from` into `to`.
async fn copy_files(from: &Path, to: &Path) -> DomainResult<()> {
    tokio::fs::create_dir_all(to)
        .await
        .map_err(|e| DomainError::resource(to, e))?;
    let mut entries = tokio::fs::read_dir(from)
        .await
        .map_err(|e| DomainError::resource(from, e))?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            tokio::fs::copy(entry.path(), to.join(entry.file_name())).await?;
        }
    }
    Ok(())
}

/// Runs one VM process per test under `work_dir`.
#[derive(Debug, Clone)]
pub struct CommandConcreteExecutor {
    id: WorkerId,
    work_dir: PathBuf,
    vm: VmConfig,
}

impl CommandConcreteExecutor {
    pub fn new(id: WorkerId, work_dir: impl Into<PathBuf>, vm: VmConfig) -> Self {
        Self {
            id,
            work_dir: work_dir.into(),
            vm,
        }
    }

    fn image_dir(&self) -> PathBuf {
        self.work_dir.join("image")
    }

    fn run_dir(&self) -> PathBuf {
        self.work_dir.join("run")
    }

    fn trace_out(&self) -> PathBuf {
        self.run_dir().join(TRACE_OUT_DIR)
    }

    async fn installed_image(&self) -> DomainResult<Option<PathBuf>> {
        Ok(self
            .image_info()
            .await?
            .map(|info| self.image_dir().join(info.file_name)))
    }
}

#[async_trait]
impl ConcreteExecutor for CommandConcreteExecutor {
    async fn image_info(&self) -> DomainResult<Option<ImageInfo>> {
        let path = self.image_dir().join(IMAGE_INFO_FILE);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(DomainError::resource(&path, e)),
        }
    }

    #[instrument(skip(self, image), fields(worker = self.id, image = %image.info.file_name))]
    async fn update_image(&self, image: &ImageSource) -> DomainResult<()> {
        let dir = self.image_dir();
        recreate_dir(&dir).await?;
        tokio::fs::copy(&image.path, dir.join(&image.info.file_name))
            .await
            .map_err(|e| DomainError::resource(&image.path, e))?;
        tokio::fs::write(dir.join(IMAGE_INFO_FILE), serde_json::to_vec(&image.info)?).await?;
        info!("image updated");
        Ok(())
    }

    async fn commence(&self, session: &Session) -> DomainResult<()> {
        recreate_dir(&self.run_dir()).await?;
        tokio::fs::write(self.run_dir().join("session.json"), serde_json::to_vec(session)?).await?;
        debug!(
            worker = self.id,
            target = session.target.as_ref().map_or("<none>", |t| t.name.as_str()),
            "concrete worker commenced"
        );
        Ok(())
    }

    async fn shared_data(&self) -> DomainResult<GuestData> {
        let Some(path) = &self.vm.guest_config else {
            warn!(worker = self.id, "no guest configuration, reporting an empty harness");
            return Ok(GuestData::default());
        };
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| DomainError::resource(path, e))?;
        serde_json::from_slice(&bytes).map_err(|e| DomainError::resource(path, e))
    }

    async fn execute(&self, test: &TestCase, processes: &ProcessSlot) -> DomainResult<()> {
        let input = self.run_dir().join(INPUT_FILE);
        tokio::fs::write(&input, test.encode_elements())
            .await
            .map_err(|e| DomainError::resource(&input, e))?;
        let trace_out = self.trace_out();
        recreate_dir(&trace_out).await?;
        let image = self
            .installed_image()
            .await?
            .map(|p| p.display().to_string())
            .unwrap_or_default();

        let input = input.display().to_string();
        let trace_dir = trace_out.display().to_string();
        let vars = [
            ("input", input.as_str()),
            ("trace_dir", trace_dir.as_str()),
            ("image", image.as_str()),
            ("snapshot", self.vm.snapshot.as_str()),
            ("arch", self.vm.arch.as_str()),
        ];
        let mut command = Command::new(&self.vm.executable);
        command
            .args(self.vm.args.iter().map(|a| substitute(a, &vars)))
            .current_dir(self.run_dir());
        processes.run(command, &self.vm.executable).await?;
        Ok(())
    }

    async fn store_trace(&self, test: &TestCase) -> DomainResult<TraceArtifact> {
        let trace_out = self.trace_out();
        let blocks = trace_out.join(BLOCK_SEQUENCE_FILE);
        if !tokio::fs::try_exists(&blocks).await.unwrap_or(false) {
            return Err(DomainError::resource(&blocks, "execution produced no block sequence"));
        }

        let traces = self.work_dir.join("traces");
        tokio::fs::create_dir_all(&traces)
            .await
            .map_err(|e| DomainError::resource(&traces, e))?;
        let artifact = TraceArtifact::allocate(&traces);
        tokio::fs::rename(&trace_out, &artifact.dir)
            .await
            .map_err(|e| DomainError::resource(&artifact.dir, e))?;
        tokio::fs::write(artifact.input_path(), test.encode_elements()).await?;
        tokio::fs::write(artifact.input_record_path(), serde_json::to_vec(test)?).await?;
        debug!(worker = self.id, trace = %artifact.id, "trace stored");
        Ok(artifact)
    }

    async fn reset(&self) -> DomainResult<()> {
        remove_dir(&self.run_dir()).await
    }
}

/// Runs the translator and the symbolic engine per trace under `work_dir`.
#[derive(Debug, Clone)]
pub struct CommandSymbolicExecutor {
    id: WorkerId,
    work_dir: PathBuf,
    svm: SvmConfig,
}

impl CommandSymbolicExecutor {
    pub fn new(id: WorkerId, work_dir: impl Into<PathBuf>, svm: SvmConfig) -> Self {
        Self {
            id,
            work_dir: work_dir.into(),
            svm,
        }
    }

    fn run_dir(&self) -> PathBuf {
        self.work_dir.join("run")
    }

    fn analysis_dir(&self, trace: &TraceArtifact) -> PathBuf {
        self.run_dir().join(&trace.id)
    }
}

/// The input a trace was recorded with, preferring the full record.
fn load_trace_input(trace: &TraceArtifact) -> DomainResult<TestCase> {
    let record = trace.input_record_path();
    if record.exists() {
        let bytes = std::fs::read(&record).map_err(|e| DomainError::resource(&record, e))?;
        return serde_json::from_slice(&bytes).map_err(|e| DomainError::resource(&record, e));
    }
    TestCase::read_elements(&trace.input_path())
}

#[async_trait]
impl SymbolicExecutor for CommandSymbolicExecutor {
    async fn commence(&self, session: &Session) -> DomainResult<()> {
        recreate_dir(&self.run_dir()).await?;
        debug!(
            worker = self.id,
            target = session.target.as_ref().map_or("<none>", |t| t.name.as_str()),
            "symbolic worker commenced"
        );
        Ok(())
    }

    #[instrument(skip(self, trace, processes), fields(worker = self.id, trace = %trace.id))]
    async fn translate(&self, trace: &TraceArtifact, processes: &ProcessSlot) -> DomainResult<()> {
        let dir = self.analysis_dir(trace);
        recreate_dir(&dir).await?;
        copy_files(&trace.dir, &dir).await?;

        let dir_str = dir.display().to_string();
        let mut parts = self.svm.translator.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| DomainError::ValidationFailed("translator command is empty".into()))?;
        let mut args: Vec<String> = parts.map(|a| substitute(a, &[("trace_dir", dir_str.as_str())])).collect();
        if !self.svm.translator.contains("{trace_dir}") {
            args.push(dir_str.clone());
        }

        let mut command = Command::new(program);
        command.args(&args).current_dir(&dir);
        processes.run(command, program).await?;

        let bitcode = dir.join(BITCODE_FILE);
        let produced = dir.join(TRANSLATOR_OUTPUT);
        if tokio::fs::try_exists(&produced).await.unwrap_or(false) {
            tokio::fs::rename(&produced, &bitcode).await?;
        }
        if !tokio::fs::try_exists(&bitcode).await.unwrap_or(false) {
            return Err(DomainError::resource(&bitcode, "translator produced no bitcode"));
        }
        Ok(())
    }

    #[instrument(skip(self, trace, processes), fields(worker = self.id, trace = %trace.id))]
    async fn solve(&self, trace: &TraceArtifact, processes: &ProcessSlot) -> DomainResult<()> {
        let dir = self.analysis_dir(trace);
        let output = dir.join(GENERATED_TESTS_DIR);
        recreate_dir(&output).await?;

        let dir_str = dir.display().to_string();
        let output_str = output.display().to_string();
        let vars = [("trace_dir", dir_str.as_str()), ("output", output_str.as_str())];
        let mut command = Command::new(&self.svm.executable);
        command
            .args(
                self.svm
                    .args
                    .concolic
                    .iter()
                    .chain(&self.svm.args.symbolic)
                    .map(|a| substitute(a, &vars)),
            )
            .arg(BITCODE_FILE)
            .current_dir(&dir);
        processes.run(command, &self.svm.executable).await?;
        Ok(())
    }

    async fn collect_tests(&self, trace: &TraceArtifact) -> DomainResult<TestBatch> {
        // The pool may drop a superseded trace's directory; read the copy.
        let local = TraceArtifact {
            id: trace.id.clone(),
            dir: self.analysis_dir(trace),
        };
        let input = load_trace_input(&local)?;
        let output = local.dir.join(GENERATED_TESTS_DIR);
        let generated = if output.exists() {
            load_test_dir(&output)?
        } else {
            Vec::new()
        };
        debug!(worker = self.id, trace = %trace.id, generated = generated.len(), "tests collected");
        let tests = generated.iter().map(|t| t.diff_against(&input)).collect();
        Ok(TestBatch { input, tests })
    }

    async fn clean(&self, trace: &TraceArtifact) -> DomainResult<()> {
        remove_dir(&self.analysis_dir(trace)).await
    }

    async fn reset(&self) -> DomainResult<()> {
        remove_dir(&self.run_dir()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::config::SvmArgs;
    use crate::domain::models::test_case::TestCaseElement;
    use crate::domain::models::trace::encode_blocks;

    #[test]
    fn test_substitute_placeholders() {
        let out = substitute("-drive {image} -loadvm {snapshot}", &[("image", "g.img"), ("snapshot", "s0")]);
        assert_eq!(out, "-drive g.img -loadvm s0");
        assert_eq!(substitute("{unknown}", &[]), "{unknown}");
    }

    #[tokio::test]
    async fn test_concrete_execute_and_store() {
        let dir = tempfile::tempdir().unwrap();
        let vm = VmConfig {
            executable: "cp".into(),
            args: vec!["{input}".into(), "{trace_dir}/tb-seq.bin".into()],
            ..VmConfig::default()
        };
        let exec = CommandConcreteExecutor::new(1, dir.path(), vm);
        // 16 encoded bytes: two blocks.
        let test = TestCase::new(vec![TestCaseElement::new("ab", b"cd".to_vec())]).with_issue_index(3);

        exec.commence(&Session::default()).await.unwrap();
        exec.execute(&test, &ProcessSlot::new()).await.unwrap();
        let artifact = exec.store_trace(&test).await.unwrap();

        assert_eq!(artifact.load_trace().unwrap().len(), 2);
        let stored = TestCase::read_elements(&artifact.input_path()).unwrap();
        assert_eq!(stored.elements(), test.elements());
        assert_eq!(load_trace_input(&artifact).unwrap().issue_index(), Some(3));
    }

    #[tokio::test]
    async fn test_store_without_trace_is_resource_error() {
        let dir = tempfile::tempdir().unwrap();
        let exec = CommandConcreteExecutor::new(1, dir.path(), VmConfig::default());
        exec.commence(&Session::default()).await.unwrap();
        let err = exec.store_trace(&TestCase::default()).await.unwrap_err();
        assert!(matches!(err, DomainError::Resource { .. }));
    }

    #[tokio::test]
    async fn test_image_update_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("guest.img");
        std::fs::write(&image, b"disk").unwrap();
        let info = ImageInfo::from_path(&image).unwrap();
        let exec = CommandConcreteExecutor::new(2, dir.path().join("w"), VmConfig::default());

        assert_eq!(exec.image_info().await.unwrap(), None);
        exec.update_image(&ImageSource {
            path: image.clone(),
            info: info.clone(),
        })
        .await
        .unwrap();
        assert_eq!(exec.image_info().await.unwrap(), Some(info));
        assert!(dir.path().join("w/image/guest.img").exists());
    }

    #[tokio::test]
    async fn test_failing_vm_is_process_error() {
        let dir = tempfile::tempdir().unwrap();
        let vm = VmConfig {
            executable: "false".into(),
            ..VmConfig::default()
        };
        let exec = CommandConcreteExecutor::new(1, dir.path(), vm);
        exec.commence(&Session::default()).await.unwrap();
        let err = exec
            .execute(&TestCase::default(), &ProcessSlot::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::Process(_)));
    }

    #[tokio::test]
    async fn test_symbolic_pipeline_produces_patches() {
        let dir = tempfile::tempdir().unwrap();
        let trace = TraceArtifact::allocate(&dir.path().join("traces"));
        std::fs::create_dir_all(&trace.dir).unwrap();
        std::fs::write(trace.block_sequence_path(), encode_blocks(&[1, 2])).unwrap();
        let input = TestCase::new(vec![TestCaseElement::new("ab", b"cd".to_vec())]).with_issue_index(3);
        std::fs::write(trace.input_path(), input.encode_elements()).unwrap();
        std::fs::write(trace.input_record_path(), serde_json::to_vec(&input).unwrap()).unwrap();

        let svm = SvmConfig {
            translator: "touch run.bc".into(),
            executable: "sh".into(),
            args: SvmArgs {
                concolic: vec!["-c".into(), "cp concrete_inputs.bin {output}/gen1".into()],
                symbolic: vec![],
            },
        };
        let exec = CommandSymbolicExecutor::new(5, dir.path().join("svm"), svm);
        let slot = ProcessSlot::new();

        exec.commence(&Session::default()).await.unwrap();
        exec.translate(&trace, &slot).await.unwrap();
        exec.solve(&trace, &slot).await.unwrap();
        let batch = exec.collect_tests(&trace).await.unwrap();

        assert_eq!(batch.input.issue_index(), Some(3));
        assert_eq!(batch.tests.len(), 1);
        assert_eq!(batch.tests[0].patch_info().unwrap().base_issue_index, 3);

        exec.clean(&trace).await.unwrap();
        assert!(!dir.path().join("svm/run").join(&trace.id).exists());
        assert!(trace.dir.exists());
    }

    #[tokio::test]
    async fn test_translator_without_bitcode_fails() {
        let dir = tempfile::tempdir().unwrap();
        let trace = TraceArtifact::allocate(dir.path());
        std::fs::create_dir_all(&trace.dir).unwrap();
        let svm = SvmConfig {
            translator: "true".into(),
            ..SvmConfig::default()
        };
        let exec = CommandSymbolicExecutor::new(5, dir.path().join("svm"), svm);
        exec.commence(&Session::default()).await.unwrap();
        let err = exec.translate(&trace, &ProcessSlot::new()).await.unwrap_err();
        assert!(matches!(err, DomainError::Resource { .. }));
    }
}
