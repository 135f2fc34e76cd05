//! Fake workers, containers and processes.

use crate::artifact::{bytes_stream, read_all, ByteStream};
use crate::cancellation::CancellationToken;
use crate::errors::{ExecError, FileNotFoundError, Result};
use crate::events::BuildStepDelegate;
use crate::resource::ResourceTypes;
use crate::worker::{
    Container, ContainerDestination, ContainerOwner, ContainerSpec, Process, ProcessIo,
    ProcessSpec, Signal, Volume, VolumeMount, Worker, WorkerClient,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;

/// A volume that is nothing but a handle.
#[derive(Debug, Clone)]
pub struct FakeVolume {
    handle: String,
}

impl FakeVolume {
    /// Creates a volume.
    #[must_use]
    pub fn new(handle: impl Into<String>) -> Self {
        Self {
            handle: handle.into(),
        }
    }
}

impl Volume for FakeVolume {
    fn handle(&self) -> &str {
        &self.handle
    }
}

/// A worker holding a fixed set of volumes.
#[derive(Debug, Clone)]
pub struct FakeWorker {
    name: String,
    volumes: HashSet<String>,
}

impl FakeWorker {
    /// Creates a worker without volumes.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            volumes: HashSet::new(),
        }
    }

    /// Adds a volume.
    #[must_use]
    pub fn with_volume(mut self, handle: impl Into<String>) -> Self {
        self.volumes.insert(handle.into());
        self
    }
}

#[async_trait]
impl Worker for FakeWorker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn lookup_volume(&self, handle: &str) -> Result<Option<Arc<dyn Volume>>> {
        if self.volumes.contains(handle) {
            Ok(Some(Arc::new(FakeVolume::new(handle))))
        } else {
            Ok(None)
        }
    }
}

/// How a fake process behaves.
#[derive(Debug, Clone)]
pub struct ProcessScript {
    /// Exit status reported when the process exits on its own.
    pub exit_status: i32,
    /// Written to stdout when the process starts.
    pub stdout: Vec<u8>,
    /// Written to stderr when the process starts.
    pub stderr: Vec<u8>,
    /// Files the process writes into its container.
    pub files: Vec<(String, Vec<u8>)>,
    /// Keeps running until signalled or told to exit.
    pub blocks: bool,
    /// Exits on SIGTERM; otherwise only SIGKILL stops it.
    pub honors_terminate: bool,
}

impl Default for ProcessScript {
    fn default() -> Self {
        Self::exiting(0)
    }
}

impl ProcessScript {
    /// Exits straight away with `status`.
    #[must_use]
    pub fn exiting(status: i32) -> Self {
        Self {
            exit_status: status,
            stdout: Vec::new(),
            stderr: Vec::new(),
            files: Vec::new(),
            blocks: false,
            honors_terminate: true,
        }
    }

    /// Runs until signalled.
    #[must_use]
    pub fn blocking() -> Self {
        Self {
            blocks: true,
            ..Self::exiting(0)
        }
    }

    /// Prints `stdout`.
    #[must_use]
    pub fn with_stdout(mut self, stdout: impl Into<Vec<u8>>) -> Self {
        self.stdout = stdout.into();
        self
    }

    /// Prints `stderr`.
    #[must_use]
    pub fn with_stderr(mut self, stderr: impl Into<Vec<u8>>) -> Self {
        self.stderr = stderr.into();
        self
    }

    /// Writes a file into the container.
    #[must_use]
    pub fn with_file(mut self, path: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        self.files.push((path.into(), content.into()));
        self
    }

    /// Ignores SIGTERM.
    #[must_use]
    pub fn ignoring_terminate(mut self) -> Self {
        self.honors_terminate = false;
        self
    }
}

/// A process driven by a [`ProcessScript`].
#[derive(Debug)]
pub struct FakeProcess {
    id: String,
    status: watch::Sender<Option<i32>>,
    honors_terminate: bool,
    signals: Mutex<Vec<Signal>>,
}

impl FakeProcess {
    /// Creates a process following `script`.
    #[must_use]
    pub fn new(id: impl Into<String>, script: &ProcessScript) -> Self {
        let initial = if script.blocks {
            None
        } else {
            Some(script.exit_status)
        };
        let (status, _) = watch::channel(initial);
        Self {
            id: id.into(),
            status,
            honors_terminate: script.honors_terminate,
            signals: Mutex::new(Vec::new()),
        }
    }

    /// Makes a running process exit with `status`.
    pub fn exit(&self, status: i32) {
        self.status.send_modify(|current| {
            if current.is_none() {
                *current = Some(status);
            }
        });
    }

    /// Signals received so far.
    #[must_use]
    pub fn signals(&self) -> Vec<Signal> {
        self.signals.lock().clone()
    }
}

#[async_trait]
impl Process for FakeProcess {
    fn id(&self) -> String {
        self.id.clone()
    }

    async fn wait(&self) -> Result<i32> {
        let mut rx = self.status.subscribe();
        loop {
            let current = *rx.borrow_and_update();
            if let Some(status) = current {
                return Ok(status);
            }
            rx.changed()
                .await
                .map_err(|_| ExecError::worker("process vanished"))?;
        }
    }

    async fn signal(&self, signal: Signal) -> Result<()> {
        self.signals.lock().push(signal);
        match signal {
            Signal::Terminate if self.honors_terminate => self.exit(143),
            Signal::Terminate => {}
            Signal::Kill => self.exit(137),
        }
        Ok(())
    }
}

/// An in-memory container.
#[derive(Debug)]
pub struct FakeContainer {
    handle: String,
    files: Mutex<BTreeMap<String, Vec<u8>>>,
    properties: Mutex<HashMap<String, String>>,
    mounts: Mutex<Vec<(String, String)>>,
    processes: Mutex<HashMap<String, Arc<FakeProcess>>>,
    script: Mutex<ProcessScript>,
    runs: Mutex<Vec<(ProcessSpec, Option<Vec<u8>>)>>,
    attached: Mutex<Vec<String>>,
    stops: Mutex<Vec<bool>>,
}

impl FakeContainer {
    /// Creates an empty container whose processes exit 0.
    #[must_use]
    pub fn new(handle: impl Into<String>) -> Self {
        Self {
            handle: handle.into(),
            files: Mutex::new(BTreeMap::new()),
            properties: Mutex::new(HashMap::new()),
            mounts: Mutex::new(Vec::new()),
            processes: Mutex::new(HashMap::new()),
            script: Mutex::new(ProcessScript::default()),
            runs: Mutex::new(Vec::new()),
            attached: Mutex::new(Vec::new()),
            stops: Mutex::new(Vec::new()),
        }
    }

    /// Sets how processes started from now on behave.
    pub fn set_script(&self, script: ProcessScript) {
        *self.script.lock() = script;
    }

    /// Writes a file.
    pub fn put_file(&self, path: impl Into<String>, content: impl Into<Vec<u8>>) {
        self.files.lock().insert(path.into(), content.into());
    }

    /// Reads a file.
    #[must_use]
    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().get(path).cloned()
    }

    /// Mounts a volume `handle` at `path`.
    pub fn add_mount(&self, path: impl Into<String>, handle: impl Into<String>) {
        let mut path = path.into();
        if !path.ends_with('/') {
            path.push('/');
        }
        self.mounts.lock().push((path, handle.into()));
    }

    /// Adds an already-running process.
    pub fn add_process(&self, process: Arc<FakeProcess>) {
        self.processes.lock().insert(process.id.clone(), process);
    }

    /// Looks up a process started in this container.
    #[must_use]
    pub fn process(&self, id: &str) -> Option<Arc<FakeProcess>> {
        self.processes.lock().get(id).cloned()
    }

    /// Every process started in or added to this container.
    #[must_use]
    pub fn processes(&self) -> Vec<Arc<FakeProcess>> {
        self.processes.lock().values().cloned().collect()
    }

    /// Every process spec run so far, with the stdin it was given.
    #[must_use]
    pub fn runs(&self) -> Vec<(ProcessSpec, Option<Vec<u8>>)> {
        self.runs.lock().clone()
    }

    /// Process ids re-attached to.
    #[must_use]
    pub fn attached(&self) -> Vec<String> {
        self.attached.lock().clone()
    }

    /// Every stop request, with its kill flag.
    #[must_use]
    pub fn stops(&self) -> Vec<bool> {
        self.stops.lock().clone()
    }

    /// Reads a property without going through the trait.
    #[must_use]
    pub fn property_value(&self, name: &str) -> Option<String> {
        self.properties.lock().get(name).cloned()
    }

    /// Sets a property without going through the trait.
    pub fn put_property(&self, name: impl Into<String>, value: impl Into<String>) {
        self.properties.lock().insert(name.into(), value.into());
    }

    fn directory_listing(&self, dir: &str) -> Option<Vec<u8>> {
        let files = self.files.lock();
        let listing: BTreeMap<&str, String> = files
            .iter()
            .filter_map(|(path, content)| {
                path.strip_prefix(dir)
                    .map(|rel| (rel, String::from_utf8_lossy(content).into_owned()))
            })
            .collect();

        if listing.is_empty() {
            None
        } else {
            serde_json::to_vec(&listing).ok()
        }
    }
}

#[async_trait]
impl Container for FakeContainer {
    fn handle(&self) -> &str {
        &self.handle
    }

    async fn run(&self, spec: ProcessSpec, io: ProcessIo) -> Result<Arc<dyn Process>> {
        let script = self.script.lock().clone();
        self.runs.lock().push((spec, io.stdin.clone()));

        for (path, content) in &script.files {
            self.put_file(path.clone(), content.clone());
        }
        if !script.stdout.is_empty() {
            io.stdout.write(&script.stdout);
        }
        if !script.stderr.is_empty() {
            io.stderr.write(&script.stderr);
        }

        let process = Arc::new(FakeProcess::new(uuid::Uuid::new_v4().to_string(), &script));
        self.add_process(Arc::clone(&process));
        Ok(process)
    }

    async fn attach(&self, process_id: &str, _io: ProcessIo) -> Result<Arc<dyn Process>> {
        self.attached.lock().push(process_id.to_string());
        match self.process(process_id) {
            Some(process) => Ok(process),
            None => Err(ExecError::worker(format!("unknown process: {process_id}"))),
        }
    }

    async fn property(&self, name: &str) -> Result<Option<String>> {
        Ok(self.property_value(name))
    }

    async fn set_property(&self, name: &str, value: &str) -> Result<()> {
        self.put_property(name, value);
        Ok(())
    }

    fn volume_mounts(&self) -> Vec<VolumeMount> {
        self.mounts
            .lock()
            .iter()
            .map(|(path, handle)| VolumeMount {
                volume: Arc::new(FakeVolume::new(handle.clone())),
                mount_path: path.clone(),
            })
            .collect()
    }

    async fn stop(&self, kill: bool) -> Result<()> {
        self.stops.lock().push(kill);
        let signal = if kill { Signal::Kill } else { Signal::Terminate };
        let processes: Vec<_> = self.processes.lock().values().cloned().collect();
        for process in processes {
            process.signal(signal).await?;
        }
        Ok(())
    }

    async fn stream_out(&self, path: &str) -> Result<ByteStream> {
        if let Some(content) = self.file(path) {
            return Ok(bytes_stream(content));
        }

        let dir = if path.ends_with('/') {
            path.to_string()
        } else {
            format!("{path}/")
        };
        self.directory_listing(&dir)
            .map(bytes_stream)
            .ok_or_else(|| FileNotFoundError::new(path).into())
    }

    async fn stream_in(&self, path: &str, stream: ByteStream) -> Result<()> {
        let content = read_all(stream).await?;
        self.put_file(path, content);
        Ok(())
    }
}

/// A worker pool handing out [`FakeContainer`]s.
///
/// Inputs in a container spec are streamed into the new container at their
/// destination paths, and each declared output directory gets its own
/// volume mount.
#[derive(Debug, Default)]
pub struct FakeWorkerClient {
    containers: Mutex<HashMap<ContainerOwner, Arc<FakeContainer>>>,
    specs: Mutex<Vec<ContainerSpec>>,
    script: Mutex<ProcessScript>,
    create_error: Mutex<Option<String>>,
}

impl FakeWorkerClient {
    /// Creates a pool whose processes exit 0.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets how processes in containers created from now on behave.
    #[must_use]
    pub fn with_script(self, script: ProcessScript) -> Self {
        *self.script.lock() = script;
        self
    }

    /// Makes container creation fail.
    #[must_use]
    pub fn failing(self, msg: impl Into<String>) -> Self {
        *self.create_error.lock() = Some(msg.into());
        self
    }

    /// Registers an existing container for `owner`.
    pub fn insert_container(&self, owner: ContainerOwner, container: Arc<FakeContainer>) {
        self.containers.lock().insert(owner, container);
    }

    /// The container registered for `owner`, if any.
    #[must_use]
    pub fn container_for(&self, owner: &ContainerOwner) -> Option<Arc<FakeContainer>> {
        self.containers.lock().get(owner).cloned()
    }

    /// Every container created so far.
    #[must_use]
    pub fn containers(&self) -> Vec<Arc<FakeContainer>> {
        self.containers.lock().values().cloned().collect()
    }

    /// Every container spec requested so far.
    #[must_use]
    pub fn specs(&self) -> Vec<ContainerSpec> {
        self.specs.lock().clone()
    }
}

#[async_trait]
impl WorkerClient for FakeWorkerClient {
    async fn find_container(&self, owner: &ContainerOwner) -> Result<Option<Arc<dyn Container>>> {
        Ok(self
            .container_for(owner)
            .map(|container| container as Arc<dyn Container>))
    }

    async fn find_or_create_container(
        &self,
        _cancel: &CancellationToken,
        _delegate: &dyn BuildStepDelegate,
        owner: &ContainerOwner,
        spec: &ContainerSpec,
        _resource_types: &ResourceTypes,
    ) -> Result<Arc<dyn Container>> {
        let create_error = self.create_error.lock().clone();
        if let Some(msg) = create_error {
            return Err(ExecError::worker(msg));
        }
        self.specs.lock().push(spec.clone());

        if let Some(existing) = self.container_for(owner) {
            return Ok(existing);
        }

        let container = Arc::new(FakeContainer::new(uuid::Uuid::new_v4().to_string()));
        container.set_script(self.script.lock().clone());
        for output in &spec.outputs {
            container.add_mount(output.clone(), uuid::Uuid::new_v4().to_string());
        }

        for input in &spec.inputs {
            let dest = ContainerDestination::new(container.clone(), input.destination_path.clone());
            input.source.stream_to(&dest).await?;
        }

        self.insert_container(owner.clone(), Arc::clone(&container));
        Ok(container)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_blocking_process_exits_on_terminate() {
        let process = FakeProcess::new("p", &ProcessScript::blocking());
        process.signal(Signal::Terminate).await.unwrap();
        assert_eq!(process.wait().await.unwrap(), 143);
    }

    #[tokio::test]
    async fn test_stubborn_process_needs_kill() {
        let process = FakeProcess::new("p", &ProcessScript::blocking().ignoring_terminate());
        process.signal(Signal::Terminate).await.unwrap();
        process.signal(Signal::Kill).await.unwrap();
        assert_eq!(process.wait().await.unwrap(), 137);
        assert_eq!(process.signals(), vec![Signal::Terminate, Signal::Kill]);
    }

    #[tokio::test]
    async fn test_container_directory_stream() {
        let container = FakeContainer::new("c");
        container.put_file("/out/a", "1");
        let listing = read_all(container.stream_out("/out").await.unwrap()).await.unwrap();
        let parsed: BTreeMap<String, String> = serde_json::from_slice(&listing).unwrap();
        assert_eq!(parsed.get("a").map(String::as_str), Some("1"));
        assert!(container.stream_out("/missing").await.is_err());
    }
}
