//! In-memory transport for unit tests.

use std::collections::HashMap;
use std::io::{self, Cursor};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::AsyncWrite;

use crate::transport::{
    CommandOutput, ConnectionTarget, Credential, ExecSession, FileSession, Link, Transport,
    TransportError,
};

type Responder = Box<dyn Fn(&str) -> Result<CommandOutput, TransportError> + Send>;
type Acceptor = Box<dyn Fn(&Credential) -> Result<(), TransportError> + Send>;

pub fn output(stdout: &str, stderr: &str, status: u32) -> CommandOutput {
    CommandOutput {
        stdout: stdout.as_bytes().to_vec(),
        stderr: stderr.as_bytes().to_vec(),
        exit_status: Some(status),
    }
}

#[derive(Default)]
struct State {
    dial_failures: u32,
    session_failures: u32,
    dials: Vec<Credential>,
    commands: Vec<String>,
    files: HashMap<String, Vec<u8>>,
    closed_file_sessions: u32,
    responder: Option<Responder>,
    acceptor: Option<Acceptor>,
    links: Vec<Arc<AtomicBool>>,
}

#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<State>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(
        &self,
        f: impl Fn(&str) -> Result<CommandOutput, TransportError> + Send + 'static,
    ) {
        self.state.lock().unwrap().responder = Some(Box::new(f));
    }

    pub fn accept(&self, f: impl Fn(&Credential) -> Result<(), TransportError> + Send + 'static) {
        self.state.lock().unwrap().acceptor = Some(Box::new(f));
    }

    pub fn reject_all(&self) {
        self.accept(|_| Err(TransportError::Rejected("no".to_string())));
    }

    /// Make the next `n` dials fail transiently.
    pub fn fail_dials(&self, n: u32) {
        self.state.lock().unwrap().dial_failures = n;
    }

    /// Make the next `n` session requests fail transiently.
    pub fn fail_sessions(&self, n: u32) {
        self.state.lock().unwrap().session_failures = n;
    }

    /// Mark every link handed out so far as dead.
    pub fn close_links(&self) {
        for link in &self.state.lock().unwrap().links {
            link.store(true, Ordering::SeqCst);
        }
    }

    pub fn dials(&self) -> u32 {
        self.state.lock().unwrap().dials.len() as u32
    }

    pub fn dialed_with(&self) -> Vec<Credential> {
        self.state.lock().unwrap().dials.clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn remote_file(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().files.get(path).cloned()
    }

    pub fn closed_file_sessions(&self) -> u32 {
        self.state.lock().unwrap().closed_file_sessions
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Link = MockLink;

    async fn dial(
        &self,
        _target: &ConnectionTarget,
        credential: &Credential,
    ) -> Result<MockLink, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.dials.push(credential.clone());
        if state.dial_failures > 0 {
            state.dial_failures -= 1;
            return Err(TransportError::Transient("network is unreachable".to_string()));
        }
        if let Some(acceptor) = &state.acceptor {
            acceptor(credential)?;
        }
        let closed = Arc::new(AtomicBool::new(false));
        state.links.push(closed.clone());
        Ok(MockLink {
            state: self.state.clone(),
            closed,
        })
    }
}

pub struct MockLink {
    state: Arc<Mutex<State>>,
    closed: Arc<AtomicBool>,
}

impl MockLink {
    fn session_check(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        if state.session_failures > 0 {
            state.session_failures -= 1;
            return Err(TransportError::Transient("channel open failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Link for MockLink {
    type Exec = MockExec;
    type Files = MockFiles;

    async fn open_exec(&self) -> Result<MockExec, TransportError> {
        self.session_check()?;
        Ok(MockExec {
            state: self.state.clone(),
        })
    }

    async fn open_files(&self) -> Result<MockFiles, TransportError> {
        self.session_check()?;
        Ok(MockFiles {
            state: self.state.clone(),
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub struct MockExec {
    state: Arc<Mutex<State>>,
}

#[async_trait]
impl ExecSession for MockExec {
    async fn run(self, command: &str) -> Result<CommandOutput, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.commands.push(command.to_string());
        match &state.responder {
            Some(responder) => responder(command),
            None => Ok(output("", "", 0)),
        }
    }
}

pub struct MockFiles {
    state: Arc<Mutex<State>>,
}

#[async_trait]
impl FileSession for MockFiles {
    type Reader = Cursor<Vec<u8>>;
    type Writer = MockWriter;

    async fn open(&self, path: &str) -> Result<Cursor<Vec<u8>>, TransportError> {
        match self.state.lock().unwrap().files.get(path) {
            Some(content) => Ok(Cursor::new(content.clone())),
            None => Err(TransportError::Transient(format!("{path}: no such file"))),
        }
    }

    async fn create(&self, path: &str) -> Result<MockWriter, TransportError> {
        Ok(MockWriter {
            state: self.state.clone(),
            path: path.to_string(),
            buf: Vec::new(),
        })
    }

    async fn close(self) -> Result<(), TransportError> {
        self.state.lock().unwrap().closed_file_sessions += 1;
        Ok(())
    }
}

/// Remote file that lands in the mock's file table on shutdown.
pub struct MockWriter {
    state: Arc<Mutex<State>>,
    path: String,
    buf: Vec<u8>,
}

impl AsyncWrite for MockWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.get_mut().buf.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let content = std::mem::take(&mut this.buf);
        this.state
            .lock()
            .unwrap()
            .files
            .insert(this.path.clone(), content);
        Poll::Ready(Ok(()))
    }
}
