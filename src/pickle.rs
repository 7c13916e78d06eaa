use std::borrow::Cow;
use std::collections::HashMap;
use std::io::Cursor;

use byteorder::{BigEndian, LittleEndian, ReadBytesExt};

use crate::error::PickleError;

// Memo entries hold arena ids, so an object completed by BUILD after being
// memoized is seen complete through every later BINGET.
pub type NodeId = usize;

const HIGHEST_PROTOCOL: u8 = 5;

// opcodes
const MARK: u8 = b'(';
const STOP: u8 = b'.';
const POP: u8 = b'0';
const POP_MARK: u8 = b'1';
const DUP: u8 = b'2';
const BINFLOAT: u8 = b'G';
const BININT: u8 = b'J';
const BININT1: u8 = b'K';
const BININT2: u8 = b'M';
const NONE: u8 = b'N';
const REDUCE: u8 = b'R';
const BINSTRING: u8 = b'T';
const SHORT_BINSTRING: u8 = b'U';
const BINUNICODE: u8 = b'X';
const APPEND: u8 = b'a';
const BUILD: u8 = b'b';
const GLOBAL: u8 = b'c';
const APPENDS: u8 = b'e';
const BINGET: u8 = b'h';
const LONG_BINGET: u8 = b'j';
const EMPTY_LIST: u8 = b']';
const BINPUT: u8 = b'q';
const LONG_BINPUT: u8 = b'r';
const SETITEM: u8 = b's';
const TUPLE: u8 = b't';
const EMPTY_TUPLE: u8 = b')';
const SETITEMS: u8 = b'u';
const EMPTY_DICT: u8 = b'}';
const BINBYTES: u8 = b'B';
const SHORT_BINBYTES: u8 = b'C';
const PROTO: u8 = 0x80;
const NEWOBJ: u8 = 0x81;
const TUPLE1: u8 = 0x85;
const TUPLE2: u8 = 0x86;
const TUPLE3: u8 = 0x87;
const NEWTRUE: u8 = 0x88;
const NEWFALSE: u8 = 0x89;
const LONG1: u8 = 0x8a;
const LONG4: u8 = 0x8b;
const SHORT_BINUNICODE: u8 = 0x8c;
const BINUNICODE8: u8 = 0x8d;
const BINBYTES8: u8 = 0x8e;
const NEWOBJ_EX: u8 = 0x92;
const STACK_GLOBAL: u8 = 0x93;
const MEMOIZE: u8 = 0x94;
const FRAME: u8 = 0x95;
const BYTEARRAY8: u8 = 0x96;

/// How Python 2 `str` values are turned into text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringEncoding {
    Latin1,
    Utf8,
}

impl StringEncoding {
    pub fn for_protocol(protocol: u8) -> Self {
        if protocol < 3 {
            StringEncoding::Latin1
        } else {
            StringEncoding::Utf8
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Python 2 `str`.
    LegacyString(Vec<u8>),
    Bytes(Vec<u8>),
    Unicode(String),
    Tuple(Vec<NodeId>),
    List(Vec<NodeId>),
    Dict(Vec<(NodeId, NodeId)>),
    Global {
        module: String,
        name: String,
    },
    /// Result of calling `callable(*args)`, optionally followed by `BUILD`.
    Object {
        callable: NodeId,
        args: NodeId,
        state: Option<NodeId>,
    },
}

#[derive(Debug)]
pub struct Pickle {
    protocol: u8,
    encoding: StringEncoding,
    nodes: Vec<Node>,
    root: NodeId,
}

impl Pickle {
    pub fn protocol(&self) -> u8 {
        self.protocol
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn int(&self, id: NodeId) -> Option<i64> {
        match self.node(id) {
            Node::Int(value) => Some(*value),
            Node::Bool(value) => Some(i64::from(*value)),
            _ => None,
        }
    }

    pub fn bool(&self, id: NodeId) -> Option<bool> {
        match self.node(id) {
            Node::Bool(value) => Some(*value),
            Node::Int(value) => Some(*value != 0),
            _ => None,
        }
    }

    pub fn tuple(&self, id: NodeId) -> Option<&[NodeId]> {
        match self.node(id) {
            Node::Tuple(items) | Node::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn text(&self, id: NodeId) -> Option<Cow<'_, str>> {
        match self.node(id) {
            Node::Unicode(text) => Some(Cow::Borrowed(text.as_str())),
            Node::LegacyString(raw) => match self.encoding {
                StringEncoding::Latin1 => {
                    Some(Cow::Owned(raw.iter().map(|&b| b as char).collect()))
                }
                StringEncoding::Utf8 => std::str::from_utf8(raw).ok().map(Cow::Borrowed),
            },
            _ => None,
        }
    }

    // Python 3 pickles `bytes` at protocol 2 as _codecs.encode(text, "latin1")
    pub fn bytes(&self, id: NodeId) -> Option<Cow<'_, [u8]>> {
        match self.node(id) {
            Node::Bytes(raw) | Node::LegacyString(raw) => Some(Cow::Borrowed(raw.as_slice())),
            Node::Object { callable, args, .. }
                if self.is_global(*callable, "_codecs", "encode") =>
            {
                let args = self.tuple(*args)?;
                let text = self.text(*args.first()?)?;
                text.chars()
                    .map(|c| u8::try_from(u32::from(c)).ok())
                    .collect::<Option<Vec<u8>>>()
                    .map(Cow::Owned)
            }
            _ => None,
        }
    }

    pub fn is_global(&self, id: NodeId, module: &str, name: &str) -> bool {
        matches!(self.node(id), Node::Global { module: m, name: n } if m == module && n == name)
    }

    pub fn constructor(&self, id: NodeId) -> Option<(&str, &str)> {
        match self.node(id) {
            Node::Object { callable, .. } => match self.node(*callable) {
                Node::Global { module, name } => Some((module.as_str(), name.as_str())),
                _ => None,
            },
            _ => None,
        }
    }
}

pub fn decode(data: &[u8], encoding: StringEncoding) -> Result<Pickle, PickleError> {
    Machine::new(data).run(encoding)
}

struct Machine<'a> {
    data: &'a [u8],
    reader: Cursor<&'a [u8]>,
    nodes: Vec<Node>,
    stack: Vec<NodeId>,
    marks: Vec<usize>,
    memo: HashMap<u32, NodeId>,
    protocol: u8,
}

impl<'a> Machine<'a> {
    fn new(data: &'a [u8]) -> Self {
        Machine {
            data,
            reader: Cursor::new(data),
            nodes: Vec::new(),
            stack: Vec::new(),
            marks: Vec::new(),
            memo: HashMap::new(),
            protocol: 0,
        }
    }

    fn run(mut self, encoding: StringEncoding) -> Result<Pickle, PickleError> {
        loop {
            let offset = self.reader.position();
            let opcode = match self.reader.read_u8() {
                Ok(opcode) => opcode,
                Err(_) => return Err(PickleError::MissingStop),
            };
            match opcode {
                PROTO => {
                    let protocol = self.reader.read_u8()?;
                    if protocol > HIGHEST_PROTOCOL {
                        return Err(PickleError::UnsupportedProtocol(protocol));
                    }
                    self.protocol = protocol;
                }
                // Frames only group opcodes for buffered readers; the whole
                // stream is already in memory.
                FRAME => {
                    self.reader.read_u64::<LittleEndian>()?;
                }
                STOP => {
                    let root = self.pop(offset)?;
                    return Ok(Pickle {
                        protocol: self.protocol,
                        encoding,
                        nodes: self.nodes,
                        root,
                    });
                }
                MARK => self.marks.push(self.stack.len()),
                POP => {
                    if self.marks.last() == Some(&self.stack.len()) {
                        self.marks.pop();
                    } else {
                        self.pop(offset)?;
                    }
                }
                POP_MARK => {
                    self.pop_mark(offset)?;
                }
                DUP => {
                    let top = *self.stack.last().ok_or(PickleError::StackUnderflow(offset))?;
                    self.stack.push(top);
                }
                NONE => self.push(Node::None),
                NEWTRUE => self.push(Node::Bool(true)),
                NEWFALSE => self.push(Node::Bool(false)),
                BININT => {
                    let value = self.reader.read_i32::<LittleEndian>()?;
                    self.push(Node::Int(i64::from(value)));
                }
                BININT1 => {
                    let value = self.reader.read_u8()?;
                    self.push(Node::Int(i64::from(value)));
                }
                BININT2 => {
                    let value = self.reader.read_u16::<LittleEndian>()?;
                    self.push(Node::Int(i64::from(value)));
                }
                LONG1 => {
                    let len = usize::from(self.reader.read_u8()?);
                    let value = decode_long(self.take(len)?)?;
                    self.push(Node::Int(value));
                }
                LONG4 => {
                    let len = self.reader.read_i32::<LittleEndian>()?;
                    let len = usize::try_from(len).map_err(|_| PickleError::UnexpectedEof)?;
                    let value = decode_long(self.take(len)?)?;
                    self.push(Node::Int(value));
                }
                BINFLOAT => {
                    let value = self.reader.read_f64::<BigEndian>()?;
                    self.push(Node::Float(value));
                }
                SHORT_BINSTRING => {
                    let len = usize::from(self.reader.read_u8()?);
                    let raw = self.take(len)?.to_vec();
                    self.push(Node::LegacyString(raw));
                }
                BINSTRING => {
                    let len = self.reader.read_i32::<LittleEndian>()?;
                    let len = usize::try_from(len).map_err(|_| PickleError::UnexpectedEof)?;
                    let raw = self.take(len)?.to_vec();
                    self.push(Node::LegacyString(raw));
                }
                SHORT_BINBYTES => {
                    let len = usize::from(self.reader.read_u8()?);
                    let raw = self.take(len)?.to_vec();
                    self.push(Node::Bytes(raw));
                }
                BINBYTES => {
                    let len = self.reader.read_u32::<LittleEndian>()? as usize;
                    let raw = self.take(len)?.to_vec();
                    self.push(Node::Bytes(raw));
                }
                BINBYTES8 | BYTEARRAY8 => {
                    let len = self.read_len64()?;
                    let raw = self.take(len)?.to_vec();
                    self.push(Node::Bytes(raw));
                }
                SHORT_BINUNICODE => {
                    let len = usize::from(self.reader.read_u8()?);
                    let text = self.take_utf8(len)?;
                    self.push(Node::Unicode(text));
                }
                BINUNICODE => {
                    let len = self.reader.read_u32::<LittleEndian>()? as usize;
                    let text = self.take_utf8(len)?;
                    self.push(Node::Unicode(text));
                }
                BINUNICODE8 => {
                    let len = self.read_len64()?;
                    let text = self.take_utf8(len)?;
                    self.push(Node::Unicode(text));
                }
                EMPTY_TUPLE => self.push(Node::Tuple(Vec::new())),
                TUPLE => {
                    let items = self.pop_mark(offset)?;
                    self.push(Node::Tuple(items));
                }
                TUPLE1 | TUPLE2 | TUPLE3 => {
                    let len = usize::from(opcode - TUPLE1 + 1);
                    if self.stack.len() < len + self.marks.last().copied().unwrap_or(0) {
                        return Err(PickleError::StackUnderflow(offset));
                    }
                    let items = self.stack.split_off(self.stack.len() - len);
                    self.push(Node::Tuple(items));
                }
                EMPTY_LIST => self.push(Node::List(Vec::new())),
                APPEND => {
                    let value = self.pop(offset)?;
                    match self.top_mut(offset)? {
                        Node::List(items) => items.push(value),
                        _ => return Err(wrong_target(offset, "list")),
                    }
                }
                APPENDS => {
                    let values = self.pop_mark(offset)?;
                    match self.top_mut(offset)? {
                        Node::List(items) => items.extend(values),
                        _ => return Err(wrong_target(offset, "list")),
                    }
                }
                EMPTY_DICT => self.push(Node::Dict(Vec::new())),
                SETITEM => {
                    let value = self.pop(offset)?;
                    let key = self.pop(offset)?;
                    match self.top_mut(offset)? {
                        Node::Dict(entries) => entries.push((key, value)),
                        _ => return Err(wrong_target(offset, "dict")),
                    }
                }
                SETITEMS => {
                    let flat = self.pop_mark(offset)?;
                    if flat.len() % 2 != 0 {
                        return Err(PickleError::StackUnderflow(offset));
                    }
                    let pairs = flat.chunks_exact(2).map(|kv| (kv[0], kv[1]));
                    match self.top_mut(offset)? {
                        Node::Dict(entries) => entries.extend(pairs),
                        _ => return Err(wrong_target(offset, "dict")),
                    }
                }
                GLOBAL => {
                    let module = self.take_line(encoding)?;
                    let name = self.take_line(encoding)?;
                    self.push(Node::Global { module, name });
                }
                STACK_GLOBAL => {
                    let name = self.pop(offset)?;
                    let module = self.pop(offset)?;
                    let (module, name) = match (&self.nodes[module], &self.nodes[name]) {
                        (Node::Unicode(module), Node::Unicode(name)) => {
                            (module.clone(), name.clone())
                        }
                        _ => return Err(wrong_target(offset, "module and name strings")),
                    };
                    self.push(Node::Global { module, name });
                }
                REDUCE | NEWOBJ => {
                    let args = self.pop(offset)?;
                    let callable = self.pop(offset)?;
                    self.push(Node::Object {
                        callable,
                        args,
                        state: None,
                    });
                }
                NEWOBJ_EX => {
                    let _kwargs = self.pop(offset)?;
                    let args = self.pop(offset)?;
                    let callable = self.pop(offset)?;
                    self.push(Node::Object {
                        callable,
                        args,
                        state: None,
                    });
                }
                BUILD => {
                    let new_state = self.pop(offset)?;
                    match self.top_mut(offset)? {
                        Node::Object { state, .. } => *state = Some(new_state),
                        _ => return Err(wrong_target(offset, "object")),
                    }
                }
                BINPUT => {
                    let key = u32::from(self.reader.read_u8()?);
                    self.memoize(key, offset)?;
                }
                LONG_BINPUT => {
                    let key = self.reader.read_u32::<LittleEndian>()?;
                    self.memoize(key, offset)?;
                }
                MEMOIZE => {
                    let key = self.memo.len() as u32;
                    self.memoize(key, offset)?;
                }
                BINGET => {
                    let key = u32::from(self.reader.read_u8()?);
                    self.recall(key)?;
                }
                LONG_BINGET => {
                    let key = self.reader.read_u32::<LittleEndian>()?;
                    self.recall(key)?;
                }
                _ => return Err(PickleError::UnsupportedOpcode { opcode, offset }),
            }
        }
    }

    fn push(&mut self, node: Node) {
        let id = self.nodes.len();
        self.nodes.push(node);
        self.stack.push(id);
    }

    fn pop(&mut self, offset: u64) -> Result<NodeId, PickleError> {
        let floor = self.marks.last().copied().unwrap_or(0);
        if self.stack.len() <= floor {
            return Err(PickleError::StackUnderflow(offset));
        }
        self.stack.pop().ok_or(PickleError::StackUnderflow(offset))
    }

    fn pop_mark(&mut self, offset: u64) -> Result<Vec<NodeId>, PickleError> {
        let mark = self.marks.pop().ok_or(PickleError::MissingMark(offset))?;
        Ok(self.stack.split_off(mark))
    }

    fn top_mut(&mut self, offset: u64) -> Result<&mut Node, PickleError> {
        let top = *self.stack.last().ok_or(PickleError::StackUnderflow(offset))?;
        Ok(&mut self.nodes[top])
    }

    fn memoize(&mut self, key: u32, offset: u64) -> Result<(), PickleError> {
        let top = *self.stack.last().ok_or(PickleError::StackUnderflow(offset))?;
        self.memo.insert(key, top);
        Ok(())
    }

    fn recall(&mut self, key: u32) -> Result<(), PickleError> {
        let id = *self.memo.get(&key).ok_or(PickleError::MissingMemo(key))?;
        self.stack.push(id);
        Ok(())
    }

    fn read_len64(&mut self) -> Result<usize, PickleError> {
        let len = self.reader.read_u64::<LittleEndian>()?;
        usize::try_from(len).map_err(|_| PickleError::UnexpectedEof)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], PickleError> {
        let start = self.reader.position() as usize;
        let end = start.checked_add(len).ok_or(PickleError::UnexpectedEof)?;
        if end > self.data.len() {
            return Err(PickleError::UnexpectedEof);
        }
        self.reader.set_position(end as u64);
        Ok(&self.data[start..end])
    }

    fn take_utf8(&mut self, len: usize) -> Result<String, PickleError> {
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| PickleError::InvalidUtf8)
    }

    fn take_line(&mut self, encoding: StringEncoding) -> Result<String, PickleError> {
        let start = self.reader.position() as usize;
        let rest = self.data.get(start..).ok_or(PickleError::UnexpectedEof)?;
        let len = rest
            .iter()
            .position(|&b| b == b'\n')
            .ok_or(PickleError::UnexpectedEof)?;
        let line = self.take(len + 1)?;
        let line = &line[..len];
        match encoding {
            StringEncoding::Latin1 => Ok(line.iter().map(|&b| b as char).collect()),
            StringEncoding::Utf8 => {
                String::from_utf8(line.to_vec()).map_err(|_| PickleError::InvalidUtf8)
            }
        }
    }
}

fn wrong_target(offset: u64, expected: &'static str) -> PickleError {
    PickleError::WrongTarget { offset, expected }
}

/// Little-endian two's complement, as written by `LONG1`/`LONG4`.
fn decode_long(raw: &[u8]) -> Result<i64, PickleError> {
    if raw.is_empty() {
        return Ok(0);
    }
    if raw.len() > 8 {
        return Err(PickleError::IntegerOverflow);
    }
    let negative = raw[raw.len() - 1] & 0x80 != 0;
    let mut buf = if negative { [0xff; 8] } else { [0; 8] };
    buf[..raw.len()].copy_from_slice(raw);
    Ok(i64::from_le_bytes(buf))
}
