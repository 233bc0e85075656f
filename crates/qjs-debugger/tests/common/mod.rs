#![allow(dead_code)]

use qjs_debugger::protocol::{Event, Message, Request, Response, StackFrame, StoppedEvent, Variable};
use qjs_debugger::{
    Debugger, DebugHost, DebuggerConfig, FunctionBreakpoints, FunctionLayout, FunctionSlot,
    LineEntry, Location, MemoryTransport, MessageChannel, Transport,
};
use serde_json::Value;

pub type Pc = (usize, usize);

pub struct Layout {
    file: &'static str,
    table: Vec<LineEntry>,
}

impl FunctionLayout for Layout {
    fn file_name(&self) -> Option<&str> {
        Some(self.file)
    }

    fn instruction_count(&self) -> usize {
        self.table.len()
    }

    fn line_table(&self) -> &[LineEntry] {
        &self.table
    }
}

pub struct Function {
    pub name: &'static str,
    pub layout: Layout,
    pub breakpoints: FunctionBreakpoints,
}

impl Function {
    /// One statement per line starting at `first_line`.
    pub fn new(name: &'static str, file: &'static str, first_line: u32, statements: u32) -> Self {
        let lines: Vec<u32> = (first_line..first_line + statements).collect();
        Self::with_lines(name, file, &lines)
    }

    /// Statement `i` sits on `lines[i]`.
    pub fn with_lines(name: &'static str, file: &'static str, lines: &[u32]) -> Self {
        Self {
            name,
            layout: Layout {
                file,
                table: lines
                    .iter()
                    .enumerate()
                    .map(|(offset, &line)| LineEntry { offset, line })
                    .collect(),
            },
            breakpoints: FunctionBreakpoints::new(),
        }
    }
}

struct Frame {
    function: usize,
    offset: usize,
    locals: Vec<(String, Value)>,
}

pub enum Op {
    /// Execute the statement at this offset of the innermost function.
    Exec(usize),
    Call(usize),
    Return,
    Throw,
    Tick,
    Assign(&'static str, i64),
}

/// A toy VM driven by a list of [`Op`]s.
pub struct ScriptedHost {
    pub functions: Vec<Function>,
    frames: Vec<Frame>,
    pub closure: Vec<(String, Value)>,
}

impl ScriptedHost {
    /// Starts in the first function at depth 1.
    pub fn new(functions: Vec<Function>) -> Self {
        Self {
            functions,
            frames: vec![Frame {
                function: 0,
                offset: 0,
                locals: Vec::new(),
            }],
            closure: Vec::new(),
        }
    }

    pub fn pc(&self) -> Pc {
        self.frames
            .last()
            .map(|f| (f.function, f.offset))
            .unwrap_or((0, 0))
    }

    /// Runs `ops`, returning how many times the program was suspended.
    pub fn run(&mut self, debugger: &mut Debugger, ops: &[Op]) -> usize {
        let mut pauses = 0;
        for op in ops {
            let paused = match op {
                Op::Exec(offset) => {
                    if let Some(frame) = self.frames.last_mut() {
                        frame.offset = *offset;
                    }
                    let pc = self.pc();
                    debugger.on_instrumentable_point(self, pc)
                }
                Op::Call(function) => {
                    self.frames.push(Frame {
                        function: *function,
                        offset: 0,
                        locals: Vec::new(),
                    });
                    false
                }
                Op::Return => {
                    self.frames.pop();
                    false
                }
                Op::Throw => {
                    let pc = self.pc();
                    debugger.on_exception(self, pc)
                }
                Op::Tick => {
                    let pc = self.pc();
                    debugger.cooperate(self, pc)
                }
                Op::Assign(name, value) => {
                    if let Some(frame) = self.frames.last_mut() {
                        frame.locals.retain(|(n, _)| n != name);
                        frame.locals.push((name.to_string(), Value::from(*value)));
                    }
                    false
                }
            };
            if paused {
                pauses += 1;
            }
        }
        pauses
    }

    fn frame(&self, index: usize) -> Option<&Frame> {
        self.frames.iter().rev().nth(index)
    }

    fn lookup(&self, frame: usize, name: &str) -> Result<Value, String> {
        self.frame(frame)
            .and_then(|f| f.locals.iter().find(|(n, _)| n == name))
            .or_else(|| self.closure.iter().find(|(n, _)| n == name))
            .map(|(_, v)| v.clone())
            .ok_or_else(|| format!("ReferenceError: {name} is not defined"))
    }
}

impl DebugHost for ScriptedHost {
    type Pc = Pc;

    fn current_location(&self, (function, offset): Pc) -> Option<Location> {
        let function = self.functions.get(function)?;
        let line = function
            .layout
            .table
            .iter()
            .rev()
            .find(|e| e.offset <= offset)?
            .line;
        Some(Location::new(function.layout.file, line, 1))
    }

    fn stack_depth(&self) -> usize {
        self.frames.len()
    }

    fn function_at(&mut self, (function, offset): Pc) -> Option<FunctionSlot<'_>> {
        let function = self.functions.get_mut(function)?;
        Some(FunctionSlot {
            breakpoints: &mut function.breakpoints,
            layout: &function.layout,
            offset,
        })
    }

    fn build_backtrace(&self, _pc: Pc) -> Vec<StackFrame> {
        self.frames
            .iter()
            .rev()
            .enumerate()
            .map(|(id, frame)| StackFrame {
                id,
                name: self.functions[frame.function].name.to_string(),
                location: self.current_location((frame.function, frame.offset)),
            })
            .collect()
    }

    fn locals_at(&self, frame: usize) -> Vec<Variable> {
        self.frame(frame)
            .map(|f| {
                f.locals
                    .iter()
                    .map(|(name, value)| Variable::new(name.clone(), value.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn closure_variables_at(&self, _frame: usize) -> Vec<Variable> {
        self.closure
            .iter()
            .map(|(name, value)| Variable::new(name.clone(), value.clone()))
            .collect()
    }

    /// Understands `name` and `name+int`.
    fn evaluate_at(&mut self, frame: usize, expression: &str) -> Result<Value, String> {
        match expression.split_once('+') {
            Some((name, addend)) => {
                let addend: i64 = addend
                    .trim()
                    .parse()
                    .map_err(|_| format!("SyntaxError: {expression}"))?;
                let value = self.lookup(frame, name.trim())?;
                value
                    .as_i64()
                    .map(|n| Value::from(n + addend))
                    .ok_or_else(|| format!("TypeError: {name} is not a number"))
            }
            None => self.lookup(frame, expression.trim()),
        }
    }
}

/// The debugger client's side of an in-memory connection.
pub struct Client {
    channel: MessageChannel<MemoryTransport>,
    seq: u64,
}

impl Client {
    pub fn request(&mut self, command: &str, arguments: Option<Value>) -> u64 {
        self.seq += 1;
        self.channel
            .try_send(&Message::Request(Request::new(self.seq, command, arguments)))
            .unwrap();
        self.seq
    }

    pub fn raw(&mut self, bytes: &[u8]) {
        self.channel.transport_mut().write_all(bytes).unwrap();
    }

    pub fn recv(&mut self) -> Message {
        self.channel.blocking_receive().unwrap()
    }

    /// Everything the engine has sent so far.
    pub fn drain(&mut self) -> Vec<Message> {
        let mut messages = Vec::new();
        while let Ok(Some(message)) = self.channel.poll_receive() {
            messages.push(message);
        }
        messages
    }

    pub fn close(&mut self) {
        self.channel.close();
    }

    pub fn channel(&mut self) -> &mut MessageChannel<MemoryTransport> {
        &mut self.channel
    }
}

pub fn config() -> DebuggerConfig {
    DebuggerConfig {
        peek_interval: 1,
        ..Default::default()
    }
}

pub fn attach() -> (Debugger, Client) {
    attach_with(config())
}

pub fn attach_with(config: DebuggerConfig) -> (Debugger, Client) {
    let (engine, client) = MemoryTransport::pair();
    let mut debugger = Debugger::new(config);
    debugger.attach(engine).unwrap();

    let mut client = Client {
        channel: MessageChannel::new(client),
        seq: 0,
    };
    assert!(matches!(client.recv(), Message::Event(Event::Thread(_))));
    (debugger, client)
}

pub fn stopped(message: &Message) -> Option<&StoppedEvent> {
    match message {
        Message::Event(Event::Stopped(stopped)) => Some(stopped),
        _ => None,
    }
}

pub fn response(message: &Message) -> Option<&Response> {
    match message {
        Message::Response(response) => Some(response),
        _ => None,
    }
}

pub fn stops(messages: &[Message]) -> Vec<&StoppedEvent> {
    messages.iter().filter_map(stopped).collect()
}

pub fn response_to(messages: &[Message], seq: u64) -> &Response {
    messages
        .iter()
        .filter_map(response)
        .find(|r| r.request_seq == seq)
        .unwrap_or_else(|| panic!("no response to request {seq}"))
}

pub fn execs(offsets: std::ops::Range<usize>) -> Vec<Op> {
    offsets.map(Op::Exec).collect()
}
