//! Client-side transfers: download and upload jobs, the machine that runs one
//! job, and the bounded queue that decides how many run at once.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::chunk::ChunkCoordinator;
use crate::command::{ClientSession, Command, CommandError};
use crate::connection::Connection;
use crate::crypto::Group;
use crate::journal::Journal;
use crate::machine::{self, Demon, Machine, MachineState, Status, TICK};
use crate::options::Options;
use crate::peer::Endpoint;
use crate::protocol::FileRef;
use crate::scheduler::{Admission, Job, Scheduler, WorkQueue};

/// Attempts before a failing job gives up.
const MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("piece outside the transfer")]
    OutOfRange,
    #[error("no progress from remote")]
    Stalled,
    #[error("cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Download,
    Upload,
}

/// A queued download or upload.
#[derive(Debug)]
pub struct TransferJob {
    direction: Direction,
    file: FileRef,
    /// Destination for downloads, source for uploads.
    path: PathBuf,
    status: Mutex<Status>,
    active: AtomicBool,
    cancelled: AtomicBool,
    transferred: AtomicU64,
}

impl TransferJob {
    /// Download `file` into `folder`, keeping its name.
    pub fn download(file: FileRef, folder: &Path) -> Self {
        let name = Path::new(&file.name)
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "download".into());
        Self::new(Direction::Download, file, folder.join(name))
    }

    /// Upload the local file at `path` of `size` bytes.
    pub fn upload(path: PathBuf, size: u64) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let file = FileRef {
            id: String::new(),
            name,
            size,
        };
        Self::new(Direction::Upload, file, path)
    }

    fn new(direction: Direction, file: FileRef, path: PathBuf) -> Self {
        Self {
            direction,
            file,
            path,
            status: Mutex::new(Status::None),
            active: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            transferred: AtomicU64::new(0),
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn file(&self) -> &FileRef {
        &self.file
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Bytes moved so far.
    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::SeqCst)
    }

    fn progress(&self, bytes: u64) {
        self.transferred.fetch_add(bytes, Ordering::SeqCst);
    }
}

impl Job for TransferJob {
    fn status(&self) -> Status {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_status(&self, status: Status) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }
}

fn check_cancel(job: Option<&TransferJob>) -> Result<(), TransferError> {
    match job {
        Some(job) if job.is_cancelled() => Err(TransferError::Cancelled),
        _ => Ok(()),
    }
}

/// How many empty polls in a row count as a stalled remote.
fn stall_limit(options: &Options) -> u32 {
    let retry = options.retry_interval().as_millis().max(1);
    (options.request_timeout().as_millis() / retry).clamp(1, u128::from(u32::MAX)) as u32
}

/// Pull one file: open the transfer, then pop pieces until every byte arrived.
pub async fn download(
    command: &mut Command<'_>,
    session: &ClientSession,
    group: &Group,
    file: &FileRef,
    dest: &Path,
    options: &Options,
    job: Option<&TransferJob>,
) -> Result<u64, TransferError> {
    let ticket = command.download_open(session, group, file).await?;
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut out = tokio::fs::File::create(dest).await?;
    out.set_len(ticket.size).await?;
    let Some(transfer) = ticket.transfer else {
        return Ok(0);
    };

    let mut received = 0u64;
    let mut idle = 0u32;
    while received < ticket.size {
        check_cancel(job)?;
        match command.download_next(session, group, &transfer).await? {
            Some(piece) => {
                if !piece.chunk.end().is_some_and(|end| end <= ticket.size) {
                    return Err(TransferError::OutOfRange);
                }
                out.seek(SeekFrom::Start(piece.chunk.offset)).await?;
                out.write_all(&piece.data).await?;
                received += u64::from(piece.chunk.size);
                if let Some(job) = job {
                    job.progress(u64::from(piece.chunk.size));
                }
                idle = 0;
            }
            None => {
                idle += 1;
                if idle > stall_limit(options) {
                    return Err(TransferError::Stalled);
                }
                tokio::time::sleep(options.retry_interval()).await;
            }
        }
    }
    out.flush().await?;
    Ok(received)
}

/// Push one file piece by piece. Refused pieces go back to the front of the pool.
pub async fn upload(
    command: &mut Command<'_>,
    session: &ClientSession,
    group: &Group,
    source: &Path,
    options: &Options,
    job: Option<&TransferJob>,
) -> Result<u64, TransferError> {
    let mut input = tokio::fs::File::open(source).await?;
    let size = input.metadata().await?.len();
    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let file = FileRef {
        id: String::new(),
        name,
        size,
    };
    let (transfer, first) = command.upload_open(session, group, &file).await?;
    let chunk_size = first.map_or(options.chunk_size, |chunk| chunk.size);
    let pieces = ChunkCoordinator::new(size, chunk_size, 1);

    let mut sent = 0u64;
    let mut idle = 0u32;
    while let Some(chunk) = pieces.pop_chunk() {
        check_cancel(job)?;
        let mut data = vec![0u8; chunk.size as usize];
        input.seek(SeekFrom::Start(chunk.offset)).await?;
        input.read_exact(&mut data).await?;
        let piece = crate::chunk::Piece { chunk, data };
        if command.upload_piece(session, group, &transfer, &piece).await? {
            sent += u64::from(chunk.size);
            if let Some(job) = job {
                job.progress(u64::from(chunk.size));
            }
            idle = 0;
        } else {
            pieces.push_chunk(chunk);
            idle += 1;
            if idle > stall_limit(options) {
                return Err(TransferError::Stalled);
            }
            tokio::time::sleep(options.retry_interval()).await;
        }
    }
    Ok(sent)
}

/// Runs one job: `Init -> Connect -> Download|Upload -> Shutdown`, with bounded restarts.
pub struct TransferMachine {
    machine: Machine,
    name: String,
    job: Arc<TransferJob>,
    connection: Connection,
    group: Group,
    options: Options,
    journal: Journal,
    queue: Arc<WorkQueue<TransferJob>>,
}

impl TransferMachine {
    pub fn new(
        name: &str,
        endpoint: &Endpoint,
        group: Group,
        options: Options,
        journal: Journal,
        job: Arc<TransferJob>,
        queue: Arc<WorkQueue<TransferJob>>,
    ) -> Self {
        Self {
            machine: Machine::new(format!("{name}/{}", job.file.name)),
            name: name.to_string(),
            connection: Connection::new(
                endpoint.address.clone(),
                endpoint.port,
                options.request_timeout(),
            ),
            job,
            group,
            options,
            journal,
            queue,
        }
    }

    pub fn job(&self) -> &Arc<TransferJob> {
        &self.job
    }

    fn command(&self) -> Command<'_> {
        Command::new(&self.connection, &self.journal, &self.name)
    }

    async fn close(&self, session: &ClientSession) {
        if let Err(e) = self.command().quit(session).await {
            tracing::debug!(transfer = %self.machine.name(), error = %e, "quit failed");
        }
    }

    async fn transfer(&self, session: &ClientSession) -> Result<u64, TransferError> {
        let mut command = self.command();
        match self.job.direction {
            Direction::Download => {
                download(
                    &mut command,
                    session,
                    &self.group,
                    &self.job.file,
                    &self.job.path,
                    &self.options,
                    Some(self.job.as_ref()),
                )
                .await
            }
            Direction::Upload => {
                upload(
                    &mut command,
                    session,
                    &self.group,
                    &self.job.path,
                    &self.options,
                    Some(self.job.as_ref()),
                )
                .await
            }
        }
    }
}

impl Demon for TransferMachine {
    fn machine(&self) -> &Machine {
        &self.machine
    }

    async fn run(self: Arc<Self>) {
        let mut session: Option<ClientSession> = None;
        let mut attempts = 0u32;
        loop {
            match self.next_state() {
                MachineState::None => break,
                MachineState::Init => {
                    self.job.set_status(Status::Info);
                    self.machine.set_state(MachineState::Connect);
                }
                MachineState::Connect => match self.command().handshake().await {
                    Ok(established) => {
                        session = Some(established);
                        self.machine.set_state(match self.job.direction {
                            Direction::Download => MachineState::Download,
                            Direction::Upload => MachineState::Upload,
                        });
                    }
                    Err(e) => {
                        tracing::warn!(
                            transfer = %self.machine.name(),
                            error = %e,
                            "connect failed"
                        );
                        self.machine.set_state(MachineState::Restart);
                    }
                },
                MachineState::Download | MachineState::Upload => {
                    let Some(s) = session.as_ref() else {
                        self.machine.set_state(MachineState::Restart);
                        continue;
                    };
                    match self.transfer(s).await {
                        Ok(bytes) => {
                            tracing::info!(
                                transfer = %self.machine.name(),
                                bytes,
                                "transfer complete"
                            );
                            self.job.set_status(Status::Success);
                            self.machine.set_status(Status::Success);
                            self.machine.set_state(MachineState::Shutdown);
                        }
                        Err(TransferError::Cancelled) => {
                            self.job.set_status(Status::Cancelled);
                            self.machine.set_status(Status::Cancelled);
                            self.machine.set_state(MachineState::Shutdown);
                        }
                        Err(e) => {
                            tracing::warn!(
                                transfer = %self.machine.name(),
                                error = %e,
                                "transfer failed"
                            );
                            self.job.set_status(Status::Warning);
                            self.machine.set_state(MachineState::Restart);
                        }
                    }
                }
                MachineState::Restart => {
                    if let Some(s) = session.take() {
                        self.close(&s).await;
                    }
                    attempts += 1;
                    if attempts >= MAX_ATTEMPTS || self.job.is_cancelled() {
                        self.job.set_status(if self.job.is_cancelled() {
                            Status::Cancelled
                        } else {
                            Status::Error
                        });
                        self.machine.set_status(Status::Error);
                        self.machine.set_state(MachineState::Shutdown);
                    } else {
                        self.machine
                            .sleep(self.options.restart_interval(), MachineState::Init);
                    }
                }
                MachineState::Shutdown => {
                    if let Some(s) = session.take() {
                        self.close(&s).await;
                    }
                    self.queue.release(&self.job);
                    self.machine.set_state(MachineState::None);
                }
                _ => {}
            }
            tokio::time::sleep(TICK).await;
        }
    }
}

/// Starts a `TransferMachine` for every job the queue admits.
pub struct TransferAdmission {
    name: String,
    endpoint: Endpoint,
    group: Group,
    options: Options,
    journal: Journal,
    running: Mutex<Vec<Arc<TransferMachine>>>,
}

impl TransferAdmission {
    pub fn new(
        name: impl Into<String>,
        endpoint: Endpoint,
        group: Group,
        options: Options,
        journal: Journal,
    ) -> Self {
        Self {
            name: name.into(),
            endpoint,
            group,
            options,
            journal,
            running: Mutex::new(Vec::new()),
        }
    }

    pub fn running(&self) -> usize {
        self.running.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Admission<TransferJob> for TransferAdmission {
    fn process(&self, queue: &Arc<WorkQueue<TransferJob>>) {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        running.retain(|m| m.job().is_active());
        while let Some(job) = queue.activate_next() {
            let worker = Arc::new(TransferMachine::new(
                &self.name,
                &self.endpoint,
                self.group.clone(),
                self.options.clone(),
                self.journal.clone(),
                job,
                Arc::clone(queue),
            ));
            machine::start(&worker);
            running.push(worker);
        }
    }

    fn shutdown(&self) {
        for worker in self.running.lock().unwrap_or_else(|e| e.into_inner()).drain(..) {
            worker.job().cancel();
            worker.machine().stop();
        }
    }
}

/// Bounded download or upload queue.
pub type TransferQueue = Scheduler<TransferJob, TransferAdmission>;

pub fn transfer_queue(
    name: &str,
    endpoint: Endpoint,
    group: Group,
    options: Options,
    journal: Journal,
    max_active: usize,
) -> TransferQueue {
    let restart_interval = options.restart_interval();
    let admission = TransferAdmission::new(name, endpoint, group, options, journal);
    Scheduler::new(format!("{name}/transfers"), max_active, admission)
        .with_restart_interval(restart_interval)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn download_job_keeps_file_name_only() {
        let file = FileRef {
            id: "music/a.ogg".into(),
            name: "../../a.ogg".into(),
            size: 3,
        };
        let job = TransferJob::download(file, Path::new("/tmp/dl"));
        assert_eq!(job.path(), Path::new("/tmp/dl/a.ogg"));
        assert_eq!(job.direction(), Direction::Download);
    }

    #[test]
    fn upload_job_describes_source() {
        let job = TransferJob::upload(PathBuf::from("/data/report.pdf"), 42);
        assert_eq!(job.file().name, "report.pdf");
        assert_eq!(job.file().size, 42);
    }

    #[test]
    fn cancel_and_progress() {
        let job = TransferJob::upload(PathBuf::from("x"), 1);
        assert!(check_cancel(Some(&job)).is_ok());
        job.progress(10);
        job.progress(5);
        assert_eq!(job.transferred(), 15);
        job.cancel();
        assert!(matches!(check_cancel(Some(&job)), Err(TransferError::Cancelled)));
        assert!(check_cancel(None).is_ok());
    }

    #[test]
    fn stall_limit_scales_with_timeouts() {
        let options = Options {
            request_timeout_secs: 2,
            retry_interval_ms: 100,
            ..Options::default()
        };
        assert_eq!(stall_limit(&options), 20);
    }
}
