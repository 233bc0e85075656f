use std::collections::BTreeSet;

use crossbeam_channel::Receiver;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::breakpoints::BreakpointTable;
use crate::config::DebuggerConfig;
use crate::connector;
use crate::error::{ChannelError, ConnectionError, RequestError, TransportError};
use crate::host::DebugHost;
use crate::location::Location;
use crate::protocol::{
    Breakpoint, Command, ContinuedEvent, Event, OutputEvent, Response, StopReason, StoppedEvent,
    TerminatedEvent, ThreadEvent, ThreadReason,
};
use crate::session::Session;
use crate::stepping::{StepController, StepMode};
use crate::transport::Transport;

/// Why and where the program is suspended.
#[derive(Debug, Clone)]
struct Stop {
    reason: StopReason,
    location: Option<Location>,
    depth: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Stay,
    Resume,
    Detach,
}

enum Incoming {
    Empty,
    Skipped,
    Command(u64, Command),
}

/// Remote debugger engine for one virtual machine instance.
///
/// The VM calls [`on_instrumentable_point`](Debugger::on_instrumentable_point)
/// at statement boundaries, [`on_exception`](Debugger::on_exception) before
/// propagating an exception and [`cooperate`](Debugger::cooperate) on a coarse
/// tick. Each of them returns `true` if the program was suspended; by the time
/// the call returns the client has resumed it or gone away.
#[derive(Debug)]
pub struct Debugger {
    config: DebuggerConfig,
    session: Option<Session>,
    breakpoints: BreakpointTable,
    stepping: StepController,
    attempted_connect: bool,
    attempted_listen: bool,
    client_log: Option<Receiver<String>>,
}

impl Default for Debugger {
    fn default() -> Self {
        Self::new(DebuggerConfig::default())
    }
}

impl Drop for Debugger {
    fn drop(&mut self) {
        self.detach();
    }
}

impl Debugger {
    pub fn new(config: DebuggerConfig) -> Self {
        Self {
            config,
            session: None,
            breakpoints: BreakpointTable::new(),
            stepping: StepController::new(),
            attempted_connect: false,
            attempted_listen: false,
            client_log: None,
        }
    }

    pub fn from_env() -> Self {
        Self::new(DebuggerConfig::from_env())
    }

    pub fn config(&self) -> &DebuggerConfig {
        &self.config
    }

    pub fn is_attached(&self) -> bool {
        self.session.is_some()
    }

    pub fn is_paused(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.paused)
    }

    pub fn breakpoints(&self) -> &BreakpointTable {
        &self.breakpoints
    }

    pub fn breakpoints_for(&self, file: &str) -> Option<&BTreeSet<u32>> {
        self.breakpoints.breakpoints_for(file)
    }

    pub fn stepping(&self) -> &StepController {
        &self.stepping
    }

    /// Sends queued log records to the client as `output` events.
    ///
    /// See [`init_client_forwarding`](crate::log::init_client_forwarding).
    pub fn forward_logs(&mut self, logs: Receiver<String>) {
        self.client_log = Some(logs);
    }

    /// Starts a session over `transport`.
    ///
    /// Only one client is served at a time; a second attach is rejected and
    /// its transport dropped.
    pub fn attach(&mut self, transport: impl Transport + 'static) -> Result<(), ConnectionError> {
        self.ensure_detached()?;

        let mut session = Session::new(
            Box::new(transport),
            self.config.stop_on_exception,
            self.config.effective_peek_interval(),
        );
        if let Err(e) = session.send_event(Event::Thread(ThreadEvent {
            reason: ThreadReason::New,
        })) {
            session.close();
            return Err(e.into());
        }

        info!("Debugger attached");
        self.session = Some(session);
        Ok(())
    }

    pub fn connect(&mut self, address: &str) -> Result<(), ConnectionError> {
        self.ensure_detached()?;
        let transport = connector::connect(address)?;
        self.attach(transport)
    }

    /// Blocks until one client connects on `address`.
    pub fn listen(&mut self, address: &str) -> Result<(), ConnectionError> {
        self.ensure_detached()?;
        let transport = connector::listen(address)?;
        self.attach(transport)
    }

    /// Attaches using the configured dial or listen address.
    ///
    /// Each mode is tried at most once per engine; the dial address wins when
    /// both are configured. Returns whether a client is attached afterwards.
    pub fn attach_from_config(&mut self) -> Result<bool, ConnectionError> {
        if self.is_attached() {
            return Ok(true);
        }

        if let Some(address) = self.config.connect_address.clone() {
            if self.attempted_connect {
                return Ok(false);
            }
            self.attempted_connect = true;
            self.connect(&address)
                .inspect_err(|e| warn!(error = %e, %address, "Failed to connect to debugger"))?;
            return Ok(true);
        }

        if let Some(address) = self.config.listen_address.clone() {
            if self.attempted_listen {
                return Ok(false);
            }
            self.attempted_listen = true;
            self.listen(&address)
                .inspect_err(|e| warn!(error = %e, %address, "Failed to wait for debugger"))?;
            return Ok(true);
        }

        Ok(false)
    }

    /// Ends the session, telling the client on a best-effort basis.
    pub fn detach(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let farewell = session
            .send_event(Event::Thread(ThreadEvent {
                reason: ThreadReason::Exited,
            }))
            .and_then(|_| session.send_event(Event::Terminated(TerminatedEvent {})));
        if let Err(e) = farewell {
            debug!(error = %e, "Client did not receive detach events");
        }
        info!("Debugger detached");
        self.close_session();
    }

    /// Statement-boundary check.
    pub fn on_instrumentable_point<H: DebugHost>(&mut self, host: &mut H, pc: H::Pc) -> bool {
        if !self.is_running() {
            return false;
        }

        let breakpoint_hit = match host.function_at(pc) {
            Some(slot) => {
                self.breakpoints.refresh(slot.breakpoints, slot.layout);
                if let Some(line) = slot.layout.line_at(slot.offset) {
                    slot.breakpoints.record_line(line);
                }
                slot.breakpoints.is_set(slot.offset)
            }
            None => false,
        };
        if !breakpoint_hit && !self.stepping.tracks_location() {
            return false;
        }

        let Some(location) = host.current_location(pc) else {
            return false;
        };
        let depth = host.stack_depth();
        self.stepping.observe(&location, depth);

        let reason = if breakpoint_hit && !self.stepping.suppresses_breakpoint(&location, depth) {
            StopReason::Breakpoint
        } else if let Some(reason) = self.stepping.completion(&location, depth) {
            reason
        } else {
            return false;
        };

        let stop = Stop {
            reason,
            location: Some(location),
            depth,
        };
        self.stop(host, pc, stop, None)
    }

    /// Pauses before an exception propagates, if exception breakpoints are on.
    pub fn on_exception<H: DebugHost>(&mut self, host: &mut H, pc: H::Pc) -> bool {
        let armed = self
            .session
            .as_ref()
            .is_some_and(|s| !s.paused && s.exception_breakpoints);
        if !armed {
            return false;
        }

        let stop = Stop {
            reason: StopReason::Exception,
            location: host.current_location(pc),
            depth: host.stack_depth(),
        };
        self.stop(host, pc, stop, None)
    }

    /// Periodic poll for client requests while the program runs.
    ///
    /// Only every `peek_interval`-th call touches the transport, and never
    /// blocks unless a request suspends the program.
    pub fn cooperate<H: DebugHost>(&mut self, host: &mut H, pc: H::Pc) -> bool {
        let interval = self.config.effective_peek_interval();
        match self.session.as_mut() {
            Some(session) if !session.paused => {
                if !session.tick(interval) {
                    return false;
                }
            }
            _ => return false,
        }

        match self.poll_requests(host, pc) {
            Ok(paused) => paused,
            Err(e) => {
                self.teardown(&e);
                false
            }
        }
    }

    fn is_running(&self) -> bool {
        self.session.as_ref().is_some_and(|s| !s.paused)
    }

    fn ensure_detached(&self) -> Result<(), ConnectionError> {
        if self.is_attached() {
            warn!("Rejecting second debugger connection");
            return Err(ConnectionError::AlreadyAttached);
        }
        Ok(())
    }

    fn session_mut(&mut self) -> Result<&mut Session, TransportError> {
        self.session.as_mut().ok_or(TransportError::InvalidHandle)
    }

    fn poll_requests<H: DebugHost>(
        &mut self,
        host: &mut H,
        pc: H::Pc,
    ) -> Result<bool, TransportError> {
        self.flush_client_log()?;

        loop {
            let (seq, command) = match self.next_command(false)? {
                Incoming::Empty => return Ok(false),
                Incoming::Skipped => continue,
                Incoming::Command(seq, command) => (seq, command),
            };

            if command.is_configuration() {
                match self.execute(host, pc, None, seq, command)? {
                    Flow::Detach => {
                        self.close_session();
                        return Ok(false);
                    }
                    Flow::Stay | Flow::Resume => continue,
                }
            }

            // Anything else interrupts the program; a non-pause request is
            // then served as the first command of the pause loop.
            let pending = if command == Command::Pause {
                self.session_mut()?.respond(Response::success(seq, None))?;
                None
            } else {
                Some((seq, command))
            };
            let stop = Stop {
                reason: StopReason::Pause,
                location: host.current_location(pc),
                depth: host.stack_depth(),
            };
            return Ok(self.stop(host, pc, stop, pending));
        }
    }

    fn stop<H: DebugHost>(
        &mut self,
        host: &mut H,
        pc: H::Pc,
        stop: Stop,
        pending: Option<(u64, Command)>,
    ) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        session.paused = true;
        self.stepping.reset();
        info!(reason = ?stop.reason, location = ?stop.location, depth = stop.depth, "Program paused");

        match self.pause_loop(host, pc, &stop, pending) {
            Ok(Flow::Detach) => self.close_session(),
            Ok(Flow::Resume | Flow::Stay) => {
                if let Some(session) = self.session.as_mut() {
                    session.paused = false;
                }
                debug!(mode = ?self.stepping.mode(), "Program resumed");
            }
            Err(e) => self.teardown(&e),
        }
        true
    }

    fn pause_loop<H: DebugHost>(
        &mut self,
        host: &mut H,
        pc: H::Pc,
        stop: &Stop,
        mut pending: Option<(u64, Command)>,
    ) -> Result<Flow, TransportError> {
        self.flush_client_log()?;
        self.session_mut()?.send_event(Event::Stopped(StoppedEvent {
            reason: stop.reason,
            location: stop.location.clone(),
            depth: stop.depth,
        }))?;

        loop {
            let (seq, command) = match pending.take() {
                Some(next) => next,
                None => match self.next_command(true)? {
                    Incoming::Command(seq, command) => (seq, command),
                    Incoming::Empty | Incoming::Skipped => continue,
                },
            };

            match self.execute(host, pc, Some(stop), seq, command)? {
                Flow::Stay => {}
                flow => return Ok(flow),
            }
        }
    }

    fn next_command(&mut self, blocking: bool) -> Result<Incoming, TransportError> {
        let session = self.session_mut()?;
        let received = if blocking {
            session.receive_request().map(Some)
        } else {
            session.poll_request()
        };

        let request = match received {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(Incoming::Empty),
            Err(ChannelError::Protocol(e)) => {
                session.reject(&e)?;
                return Ok(Incoming::Skipped);
            }
            Err(ChannelError::Transport(e)) => return Err(e),
        };

        match Command::from_request(&request) {
            Ok(command) => {
                debug!(?command, seq = request.seq, "Received request");
                Ok(Incoming::Command(request.seq, command))
            }
            Err(e) => {
                warn!(error = %e, seq = request.seq, "Rejected request");
                session.respond(Response::error(request.seq, e.to_string()))?;
                Ok(Incoming::Skipped)
            }
        }
    }

    /// Applies `command` and answers it. Only transport failures escape.
    fn execute<H: DebugHost>(
        &mut self,
        host: &mut H,
        pc: H::Pc,
        stop: Option<&Stop>,
        seq: u64,
        command: Command,
    ) -> Result<Flow, TransportError> {
        let result = self.apply(host, pc, stop, &command);
        let session = self.session_mut()?;

        match result {
            Ok(body) => session.respond(Response::success(seq, body))?,
            Err(e) => {
                debug!(error = %e, seq, "Request failed");
                session.respond(Response::error(seq, e.to_string()))?;
                return Ok(Flow::Stay);
            }
        }

        match command {
            Command::Continue | Command::Next | Command::StepIn | Command::StepOut => {
                session.send_event(Event::Continued(ContinuedEvent {}))?;
                Ok(Flow::Resume)
            }
            Command::Disconnect => Ok(Flow::Detach),
            _ => Ok(Flow::Stay),
        }
    }

    fn apply<H: DebugHost>(
        &mut self,
        host: &mut H,
        pc: H::Pc,
        stop: Option<&Stop>,
        command: &Command,
    ) -> Result<Option<Value>, RequestError> {
        match command {
            Command::Backtrace => {
                paused(stop, command)?;
                let frames = host.build_backtrace(pc);
                Ok(Some(json!({
                    "stackFrames": frames,
                    "totalFrames": frames.len(),
                })))
            }
            Command::Locals(args) => {
                paused(stop, command)?;
                check_frame(host, args.frame_index)?;
                Ok(Some(json!({ "variables": host.locals_at(args.frame_index) })))
            }
            Command::ClosureVariables(args) => {
                paused(stop, command)?;
                check_frame(host, args.frame_index)?;
                Ok(Some(
                    json!({ "variables": host.closure_variables_at(args.frame_index) }),
                ))
            }
            Command::Evaluate(args) => {
                paused(stop, command)?;
                check_frame(host, args.frame_index)?;
                let value = host
                    .evaluate_at(args.frame_index, &args.expression)
                    .map_err(RequestError::Evaluation)?;
                Ok(Some(json!({ "value": value })))
            }
            Command::SetBreakpoints(args) => {
                self.breakpoints
                    .set_breakpoints(&args.file, args.breakpoints.iter().map(|bp| bp.line));
                let breakpoints: Vec<Breakpoint> = args
                    .breakpoints
                    .iter()
                    .map(|bp| Breakpoint {
                        line: bp.line,
                        column: bp.column,
                        verified: true,
                    })
                    .collect();
                Ok(Some(json!({ "breakpoints": breakpoints })))
            }
            Command::SetExceptionBreakpoints(args) => {
                if let Some(session) = self.session.as_mut() {
                    session.exception_breakpoints = args.enabled;
                }
                debug!(enabled = args.enabled, "Exception breakpoints toggled");
                Ok(None)
            }
            Command::Continue => {
                let stop = paused(stop, command)?;
                if matches!(stop.reason, StopReason::Breakpoint | StopReason::Exception) {
                    self.stepping
                        .start(StepMode::StepContinue, stop.location.clone(), stop.depth);
                } else {
                    self.stepping.reset();
                }
                Ok(None)
            }
            Command::Next => self.start_step(StepMode::Step, stop, command),
            Command::StepIn => self.start_step(StepMode::StepIn, stop, command),
            Command::StepOut => self.start_step(StepMode::StepOut, stop, command),
            Command::Pause => Ok(None),
            Command::Disconnect => {
                info!("Debugger client disconnected");
                Ok(None)
            }
        }
    }

    fn start_step(
        &mut self,
        mode: StepMode,
        stop: Option<&Stop>,
        command: &Command,
    ) -> Result<Option<Value>, RequestError> {
        let stop = paused(stop, command)?;
        self.stepping.start(mode, stop.location.clone(), stop.depth);
        Ok(None)
    }

    fn flush_client_log(&mut self) -> Result<(), TransportError> {
        let Some(logs) = self.client_log.as_ref() else {
            return Ok(());
        };
        // Only what is queued now; sending may log again.
        let queued = logs.len();
        if queued == 0 {
            return Ok(());
        }
        let lines: Vec<String> = logs.try_iter().take(queued).collect();

        let session = self.session_mut()?;
        for output in lines {
            session.send_event(Event::Output(OutputEvent {
                category: "console".to_string(),
                output,
            }))?;
        }
        Ok(())
    }

    fn teardown(&mut self, error: &TransportError) {
        warn!(error = %error, "Debugger connection lost, continuing without debugger");
        self.close_session();
    }

    fn close_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close();
        }
        self.breakpoints.clear();
        self.stepping.reset();
    }
}

fn paused<'a>(stop: Option<&'a Stop>, command: &Command) -> Result<&'a Stop, RequestError> {
    stop.ok_or_else(|| RequestError::NotPaused(command.name().to_string()))
}

fn check_frame<H: DebugHost>(host: &H, index: usize) -> Result<(), RequestError> {
    let depth = host.stack_depth();
    if index < depth {
        Ok(())
    } else {
        Err(RequestError::FrameOutOfRange { index, depth })
    }
}
