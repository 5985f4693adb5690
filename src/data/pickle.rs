//! Decoder for the subset of Python's pickle format that NumPy uses to
//! serialize arrays, tuples of arrays and the few builtins around them.
//!
//! Objects are rebuilt only for the callables matched in `reduce`;
//! any other global is rejected, so the stream never gets to run code.

use std::collections::HashMap;
use std::io::{BufRead, Read};
use std::rc::Rc;

use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt};
use ndarray::{Array2, ShapeBuilder};

use crate::error::{DataError, Result};

/// Highest pickle protocol understood.
const HIGHEST_PROTOCOL: u8 = 5;

// ---------------------------------------------------------------------------
// Decoded values
// ---------------------------------------------------------------------------

/// A decoded pickle object. Heavy variants are reference counted because the
/// pickle memo and the stack share them.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Bytes(Rc<Vec<u8>>),
    Str(Rc<str>),
    Tuple(Rc<Vec<Value>>),
    List(Rc<Vec<Value>>),
    Dict(Rc<Vec<(Value, Value)>>),
    Global { module: String, name: String },
    Dtype(Rc<Dtype>),
    Array(Rc<NdArray>),
}

impl Value {
    fn kind(&self) -> &'static str {
        match self {
            Value::None => "None",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Bytes(_) => "bytes",
            Value::Str(_) => "str",
            Value::Tuple(_) => "tuple",
            Value::List(_) => "list",
            Value::Dict(_) => "dict",
            Value::Global { .. } => "global",
            Value::Dtype(_) => "dtype",
            Value::Array(_) => "ndarray",
        }
    }

    fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    /// Text of a `str`, or of a Python 2 byte string read as latin-1.
    fn as_text(&self) -> Option<String> {
        match self {
            Value::Str(s) => Some(s.to_string()),
            Value::Bytes(b) => Some(b.iter().map(|&c| c as char).collect()),
            _ => None,
        }
    }

    /// Raw bytes of a byte string, or of a `str` holding latin-1 text.
    fn to_raw_bytes(&self) -> Option<Vec<u8>> {
        match self {
            Value::Bytes(b) => Some(b.as_ref().clone()),
            Value::Str(s) => latin1_bytes(s),
            _ => None,
        }
    }

    fn as_items(&self) -> Option<&[Value]> {
        match self {
            Value::Tuple(items) | Value::List(items) => Some(items.as_slice()),
            _ => None,
        }
    }

    /// Take the items of a tuple or list, cloning only if still shared.
    pub fn into_items(self) -> Result<Vec<Value>> {
        match self {
            Value::Tuple(items) | Value::List(items) => Ok(Rc::unwrap_or_clone(items)),
            other => Err(DataError::format(format!(
                "expected a tuple or list, found {}",
                other.kind()
            ))),
        }
    }

    /// Take a decoded NumPy array, cloning only if still shared.
    pub fn into_array(self) -> Result<NdArray> {
        match self {
            Value::Array(array) => Ok(Rc::unwrap_or_clone(array)),
            other => Err(DataError::format(format!(
                "expected a numpy array, found {}",
                other.kind()
            ))),
        }
    }

    fn same_object(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
            (Value::Dtype(a), Value::Dtype(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

fn latin1_bytes(s: &str) -> Option<Vec<u8>> {
    s.chars().map(|c| u8::try_from(u32::from(c)).ok()).collect()
}

// ---------------------------------------------------------------------------
// NumPy dtype and array
// ---------------------------------------------------------------------------

/// Element type of a NumPy array, e.g. `<f4` or `<i8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dtype {
    /// NumPy kind character: `f`, `i`, `u` or `b`.
    pub kind: char,
    /// Bytes per element.
    pub size: usize,
    pub little_endian: bool,
}

impl Dtype {
    /// Parse a NumPy type string such as `f4`, `<i8` or `|u1`.
    pub fn parse(descr: &str) -> Result<Self> {
        let (little_endian, rest) = match descr.chars().next() {
            Some('>') => (false, &descr[1..]),
            Some('<' | '|' | '=') => (true, &descr[1..]),
            _ => (true, descr),
        };
        let mut chars = rest.chars();
        let kind = chars
            .next()
            .ok_or_else(|| DataError::format("empty dtype descriptor"))?;
        let size: usize = chars
            .as_str()
            .parse()
            .map_err(|_| DataError::format(format!("unsupported dtype '{descr}'")))?;

        let dtype = Dtype {
            kind,
            size,
            little_endian,
        };
        match (kind, size) {
            ('f', 4 | 8) | ('i', 1 | 2 | 4 | 8) | ('u', 1 | 2 | 4) | ('b', 1) => Ok(dtype),
            _ => Err(DataError::format(format!("unsupported dtype '{descr}'"))),
        }
    }

    fn decode(&self, raw: &[u8], count: usize) -> Result<ArrayData> {
        let expected = count
            .checked_mul(self.size)
            .ok_or_else(|| DataError::format("array shape overflows usize"))?;
        if raw.len() != expected {
            return Err(DataError::format(format!(
                "array holds {} bytes, expected {count} elements of {} bytes",
                raw.len(),
                self.size
            )));
        }
        if self.little_endian {
            decode_with::<LittleEndian>(self.kind, self.size, raw)
        } else {
            decode_with::<BigEndian>(self.kind, self.size, raw)
        }
    }
}

fn decode_with<B: ByteOrder>(kind: char, size: usize, raw: &[u8]) -> Result<ArrayData> {
    let chunks = raw.chunks_exact(size);
    let data = match (kind, size) {
        ('f', 4) => ArrayData::Float(chunks.map(|c| B::read_f32(c) as f64).collect()),
        ('f', 8) => ArrayData::Float(chunks.map(B::read_f64).collect()),
        ('i', 1) => ArrayData::Int(chunks.map(|c| c[0] as i8 as i64).collect()),
        ('i', 2) => ArrayData::Int(chunks.map(|c| B::read_i16(c) as i64).collect()),
        ('i', 4) => ArrayData::Int(chunks.map(|c| B::read_i32(c) as i64).collect()),
        ('i', 8) => ArrayData::Int(chunks.map(B::read_i64).collect()),
        ('u', 1) | ('b', 1) => ArrayData::Int(chunks.map(|c| c[0] as i64).collect()),
        ('u', 2) => ArrayData::Int(chunks.map(|c| B::read_u16(c) as i64).collect()),
        ('u', 4) => ArrayData::Int(chunks.map(|c| B::read_u32(c) as i64).collect()),
        _ => {
            return Err(DataError::format(format!(
                "unsupported dtype {kind}{size}"
            )))
        }
    };
    Ok(data)
}

/// Element storage of a decoded array.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayData {
    Float(Vec<f64>),
    Int(Vec<i64>),
}

/// A NumPy array rebuilt from its pickled state.
#[derive(Debug, Clone, PartialEq)]
pub struct NdArray {
    pub shape: Vec<usize>,
    /// Elements are stored column-major when set.
    pub fortran_order: bool,
    pub data: ArrayData,
}

impl NdArray {
    /// What `_reconstruct` returns before `BUILD` fills it in.
    fn placeholder() -> Self {
        NdArray {
            shape: vec![0],
            fortran_order: false,
            data: ArrayData::Float(Vec::new()),
        }
    }

    fn from_buffer(raw: &[u8], dtype: &Dtype, shape: Vec<usize>, fortran_order: bool) -> Result<Self> {
        let count = shape
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
            .ok_or_else(|| DataError::format("array shape overflows usize"))?;
        Ok(NdArray {
            data: dtype.decode(raw, count)?,
            shape,
            fortran_order,
        })
    }

    /// Apply the `__setstate__` tuple of `ndarray`:
    /// `(version, shape, dtype, is_fortran, rawdata)`, version optional.
    fn from_state(state: &Value) -> Result<Self> {
        let items = state
            .as_items()
            .ok_or_else(|| DataError::format("ndarray state is not a tuple"))?;
        let fields = match items.len() {
            5 => &items[1..],
            4 => items,
            n => {
                return Err(DataError::format(format!(
                    "ndarray state has {n} fields"
                )))
            }
        };

        let shape = shape_of(&fields[0])?;
        let dtype = match &fields[1] {
            Value::Dtype(dtype) => dtype.as_ref(),
            other => {
                return Err(DataError::format(format!(
                    "ndarray dtype is a {}",
                    other.kind()
                )))
            }
        };
        let fortran_order = fields[2]
            .as_int()
            .ok_or_else(|| DataError::format("ndarray order flag is not a bool"))?
            != 0;
        let raw = fields[3]
            .to_raw_bytes()
            .ok_or_else(|| DataError::format("object arrays are not supported"))?;

        NdArray::from_buffer(&raw, dtype, shape, fortran_order)
    }

    /// Convert a 2-D array to a row-major `f64` matrix.
    pub fn into_matrix(self) -> Result<Array2<f64>> {
        let (rows, cols) = match self.shape[..] {
            [rows, cols] => (rows, cols),
            _ => {
                return Err(DataError::format(format!(
                    "expected a 2-D array, found shape {:?}",
                    self.shape
                )))
            }
        };
        let values = match self.data {
            ArrayData::Float(v) => v,
            ArrayData::Int(v) => v.into_iter().map(|x| x as f64).collect(),
        };
        let matrix = if self.fortran_order {
            Array2::from_shape_vec((rows, cols).f(), values)
        } else {
            Array2::from_shape_vec((rows, cols), values)
        };
        let matrix = matrix.map_err(|e| DataError::format(format!("array shape: {e}")))?;
        Ok(matrix.as_standard_layout().into_owned())
    }

    /// Convert a 1-D integer array to a label vector.
    pub fn into_labels(self) -> Result<Vec<i64>> {
        if self.shape.len() != 1 {
            return Err(DataError::format(format!(
                "expected a 1-D label array, found shape {:?}",
                self.shape
            )));
        }
        match self.data {
            ArrayData::Int(v) => Ok(v),
            ArrayData::Float(_) => Err(DataError::format("labels must be integers")),
        }
    }
}

fn shape_of(value: &Value) -> Result<Vec<usize>> {
    let dims = value
        .as_items()
        .ok_or_else(|| DataError::format("array shape is not a tuple"))?;
    dims.iter()
        .map(|d| {
            d.as_int()
                .and_then(|d| usize::try_from(d).ok())
                .ok_or_else(|| DataError::format("array dimension is not a size"))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Unpickler
// ---------------------------------------------------------------------------

/// Decode one pickled object from `reader`.
pub fn from_reader<R: BufRead>(reader: R) -> Result<Value> {
    Unpickler::new(reader).load()
}

struct Unpickler<R> {
    reader: R,
    stack: Vec<Value>,
    marks: Vec<usize>,
    memo: HashMap<usize, Value>,
}

impl<R: BufRead> Unpickler<R> {
    fn new(reader: R) -> Self {
        Unpickler {
            reader,
            stack: Vec::new(),
            marks: Vec::new(),
            memo: HashMap::new(),
        }
    }

    fn load(mut self) -> Result<Value> {
        loop {
            let opcode = self.reader.read_u8().map_err(DataError::from_stream)?;
            match opcode {
                // Framing and protocol
                0x80 => {
                    let protocol = self.read_u8()?;
                    if protocol > HIGHEST_PROTOCOL {
                        return Err(DataError::format(format!(
                            "pickle protocol {protocol} is not supported"
                        )));
                    }
                    log::debug!("pickle protocol {protocol}");
                }
                0x95 => {
                    self.reader
                        .read_u64::<LittleEndian>()
                        .map_err(DataError::from_stream)?;
                }
                b'.' => return self.pop(),

                // Stack manipulation
                b'(' => self.marks.push(self.stack.len()),
                b'0' => {
                    self.pop()?;
                }
                b'1' => {
                    self.pop_mark()?;
                }
                b'2' => {
                    let top = self.top()?.clone();
                    self.stack.push(top);
                }

                // Scalars
                b'N' => self.stack.push(Value::None),
                0x88 => self.stack.push(Value::Bool(true)),
                0x89 => self.stack.push(Value::Bool(false)),
                b'K' => {
                    let v = self.read_u8()?;
                    self.stack.push(Value::Int(v as i64));
                }
                b'M' => {
                    let v = self
                        .reader
                        .read_u16::<LittleEndian>()
                        .map_err(DataError::from_stream)?;
                    self.stack.push(Value::Int(v as i64));
                }
                b'J' => {
                    let v = self
                        .reader
                        .read_i32::<LittleEndian>()
                        .map_err(DataError::from_stream)?;
                    self.stack.push(Value::Int(v as i64));
                }
                0x8a => {
                    let len = self.read_u8()? as usize;
                    let v = self.read_long(len)?;
                    self.stack.push(v);
                }
                0x8b => {
                    let len = self.read_u32()? as usize;
                    let v = self.read_long(len)?;
                    self.stack.push(v);
                }
                b'I' => {
                    let line = self.read_line()?;
                    let v = match line.as_str() {
                        "00" => Value::Bool(false),
                        "01" => Value::Bool(true),
                        text => Value::Int(parse_text(text)?),
                    };
                    self.stack.push(v);
                }
                b'L' => {
                    let line = self.read_line()?;
                    let v = parse_text(line.trim_end_matches('L'))?;
                    self.stack.push(Value::Int(v));
                }
                b'F' => {
                    let line = self.read_line()?;
                    self.stack.push(Value::Float(parse_text(&line)?));
                }
                b'G' => {
                    let v = self
                        .reader
                        .read_f64::<BigEndian>()
                        .map_err(DataError::from_stream)?;
                    self.stack.push(Value::Float(v));
                }

                // Byte strings (Python 2 str, Python 3 bytes and bytearray)
                b'U' | b'C' => {
                    let len = self.read_u8()? as usize;
                    let bytes = self.read_bytes(len)?;
                    self.stack.push(Value::Bytes(Rc::new(bytes)));
                }
                b'T' | b'B' => {
                    let len = self.read_u32()? as usize;
                    let bytes = self.read_bytes(len)?;
                    self.stack.push(Value::Bytes(Rc::new(bytes)));
                }
                0x8e | 0x96 => {
                    let len = self.read_u64()?;
                    let bytes = self.read_bytes(len)?;
                    self.stack.push(Value::Bytes(Rc::new(bytes)));
                }
                b'S' => {
                    let line = self.read_line()?;
                    let bytes = unquote(&line)?;
                    self.stack.push(Value::Bytes(Rc::new(bytes)));
                }
                0x98 => {}
                0x97 => return Err(DataError::format("out-of-band buffers are not supported")),

                // Unicode strings
                b'V' => {
                    let line = self.read_line_bytes()?;
                    let text = raw_unicode_unescape(&line)?;
                    self.stack.push(Value::Str(text.into()));
                }
                0x8c => {
                    let len = self.read_u8()? as usize;
                    let text = self.read_utf8(len)?;
                    self.stack.push(Value::Str(text.into()));
                }
                b'X' => {
                    let len = self.read_u32()? as usize;
                    let text = self.read_utf8(len)?;
                    self.stack.push(Value::Str(text.into()));
                }
                0x8d => {
                    let len = self.read_u64()?;
                    let text = self.read_utf8(len)?;
                    self.stack.push(Value::Str(text.into()));
                }

                // Containers
                b')' => self.stack.push(Value::Tuple(Rc::new(Vec::new()))),
                b't' => {
                    let items = self.pop_mark()?;
                    self.stack.push(Value::Tuple(Rc::new(items)));
                }
                0x85..=0x87 => {
                    let n = (opcode - 0x84) as usize;
                    if self.stack.len() < n {
                        return Err(DataError::format("stack underflow building tuple"));
                    }
                    let items = self.stack.split_off(self.stack.len() - n);
                    self.stack.push(Value::Tuple(Rc::new(items)));
                }
                b']' => self.stack.push(Value::List(Rc::new(Vec::new()))),
                b'l' => {
                    let items = self.pop_mark()?;
                    self.stack.push(Value::List(Rc::new(items)));
                }
                b'a' => {
                    let item = self.pop()?;
                    self.extend_list(vec![item])?;
                }
                b'e' => {
                    let items = self.pop_mark()?;
                    self.extend_list(items)?;
                }
                b'}' => self.stack.push(Value::Dict(Rc::new(Vec::new()))),
                b'd' => {
                    let items = self.pop_mark()?;
                    let pairs = pairs_of(items)?;
                    self.stack.push(Value::Dict(Rc::new(pairs)));
                }
                b's' => {
                    let value = self.pop()?;
                    let key = self.pop()?;
                    self.extend_dict(vec![(key, value)])?;
                }
                b'u' => {
                    let items = self.pop_mark()?;
                    let pairs = pairs_of(items)?;
                    self.extend_dict(pairs)?;
                }

                // Memo
                b'p' => {
                    let index = parse_text(&self.read_line()?)?;
                    self.put(index)?;
                }
                b'q' => {
                    let index = self.read_u8()? as usize;
                    self.put(index)?;
                }
                b'r' => {
                    let index = self.read_u32()? as usize;
                    self.put(index)?;
                }
                0x94 => {
                    let index = self.memo.len();
                    self.put(index)?;
                }
                b'g' => {
                    let index = parse_text(&self.read_line()?)?;
                    self.get(index)?;
                }
                b'h' => {
                    let index = self.read_u8()? as usize;
                    self.get(index)?;
                }
                b'j' => {
                    let index = self.read_u32()? as usize;
                    self.get(index)?;
                }

                // Object construction
                b'c' => {
                    let module = self.read_line()?;
                    let name = self.read_line()?;
                    self.stack.push(Value::Global { module, name });
                }
                0x93 => {
                    let name = self.pop()?;
                    let module = self.pop()?;
                    match (module, name) {
                        (Value::Str(module), Value::Str(name)) => self.stack.push(Value::Global {
                            module: module.to_string(),
                            name: name.to_string(),
                        }),
                        _ => return Err(DataError::format("STACK_GLOBAL expects two strings")),
                    }
                }
                b'R' => {
                    let args = self.pop()?;
                    let callable = self.pop()?;
                    let value = reduce(&callable, &args)?;
                    self.stack.push(value);
                }
                b'b' => {
                    let state = self.pop()?;
                    let target = self.pop()?;
                    let built = build(&target, &state)?;
                    for entry in self.memo.values_mut() {
                        if entry.same_object(&target) {
                            *entry = built.clone();
                        }
                    }
                    self.stack.push(built);
                }

                other => {
                    return Err(DataError::format(format!(
                        "unsupported pickle opcode 0x{other:02x}"
                    )))
                }
            }
        }
    }

    // -- Stack helpers --

    fn pop(&mut self) -> Result<Value> {
        self.stack
            .pop()
            .ok_or_else(|| DataError::format("pickle stack underflow"))
    }

    fn top(&self) -> Result<&Value> {
        self.stack
            .last()
            .ok_or_else(|| DataError::format("pickle stack underflow"))
    }

    fn pop_mark(&mut self) -> Result<Vec<Value>> {
        let mark = self
            .marks
            .pop()
            .ok_or_else(|| DataError::format("pickle mark missing"))?;
        if mark > self.stack.len() {
            return Err(DataError::format("pickle mark past end of stack"));
        }
        Ok(self.stack.split_off(mark))
    }

    fn extend_list(&mut self, items: Vec<Value>) -> Result<()> {
        match self.stack.last_mut() {
            Some(Value::List(list)) => {
                Rc::make_mut(list).extend(items);
                Ok(())
            }
            _ => Err(DataError::format("APPEND target is not a list")),
        }
    }

    fn extend_dict(&mut self, pairs: Vec<(Value, Value)>) -> Result<()> {
        match self.stack.last_mut() {
            Some(Value::Dict(dict)) => {
                Rc::make_mut(dict).extend(pairs);
                Ok(())
            }
            _ => Err(DataError::format("SETITEM target is not a dict")),
        }
    }

    fn put(&mut self, index: usize) -> Result<()> {
        let top = self.top()?.clone();
        self.memo.insert(index, top);
        Ok(())
    }

    fn get(&mut self, index: usize) -> Result<()> {
        let value = self
            .memo
            .get(&index)
            .cloned()
            .ok_or_else(|| DataError::format(format!("memo entry {index} missing")))?;
        self.stack.push(value);
        Ok(())
    }

    // -- Reading helpers --

    fn read_u8(&mut self) -> Result<u8> {
        self.reader.read_u8().map_err(DataError::from_stream)
    }

    fn read_u32(&mut self) -> Result<u32> {
        self.reader
            .read_u32::<LittleEndian>()
            .map_err(DataError::from_stream)
    }

    fn read_u64(&mut self) -> Result<usize> {
        let len = self
            .reader
            .read_u64::<LittleEndian>()
            .map_err(DataError::from_stream)?;
        usize::try_from(len).map_err(|_| DataError::format("pickle length overflows usize"))
    }

    fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        (&mut self.reader)
            .take(len as u64)
            .read_to_end(&mut buf)
            .map_err(DataError::from_stream)?;
        if buf.len() != len {
            return Err(DataError::format("pickle stream truncated"));
        }
        Ok(buf)
    }

    fn read_utf8(&mut self, len: usize) -> Result<String> {
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes).map_err(|_| DataError::format("invalid UTF-8 in pickle string"))
    }

    /// One newline-terminated argument, without the newline.
    fn read_line_bytes(&mut self) -> Result<Vec<u8>> {
        let mut line = Vec::new();
        self.reader
            .read_until(b'\n', &mut line)
            .map_err(DataError::from_stream)?;
        if line.pop() != Some(b'\n') {
            return Err(DataError::format("pickle stream truncated"));
        }
        Ok(line)
    }

    fn read_line(&mut self) -> Result<String> {
        let mut line = self.read_line_bytes()?;
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        String::from_utf8(line).map_err(|_| DataError::format("invalid text opcode argument"))
    }

    /// Little-endian two's complement integer of `len` bytes.
    fn read_long(&mut self, len: usize) -> Result<Value> {
        if len > 8 {
            return Err(DataError::format(format!("{len}-byte integer overflows i64")));
        }
        let bytes = self.read_bytes(len)?;
        if bytes.is_empty() {
            return Ok(Value::Int(0));
        }
        Ok(Value::Int(LittleEndian::read_int(&bytes, len)))
    }
}

fn parse_text<T: std::str::FromStr>(text: &str) -> Result<T> {
    text.trim()
        .parse()
        .map_err(|_| DataError::format(format!("bad numeric literal '{text}'")))
}

fn pairs_of(items: Vec<Value>) -> Result<Vec<(Value, Value)>> {
    if items.len() % 2 != 0 {
        return Err(DataError::format("dict items are not key/value pairs"));
    }
    let mut pairs = Vec::with_capacity(items.len() / 2);
    let mut iter = items.into_iter();
    while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
        pairs.push((key, value));
    }
    Ok(pairs)
}

/// Decode a protocol 0 `STRING` argument: a quoted Python 2 literal.
fn unquote(line: &str) -> Result<Vec<u8>> {
    let bytes = line.as_bytes();
    let quoted = bytes.len() >= 2
        && (bytes[0] == b'\'' || bytes[0] == b'"')
        && bytes[bytes.len() - 1] == bytes[0];
    if !quoted {
        return Err(DataError::format("STRING argument is not quoted"));
    }

    let body = &bytes[1..bytes.len() - 1];
    let mut out = Vec::with_capacity(body.len());
    let mut i = 0;
    while i < body.len() {
        if body[i] != b'\\' {
            out.push(body[i]);
            i += 1;
            continue;
        }
        let escape = *body
            .get(i + 1)
            .ok_or_else(|| DataError::format("dangling escape in STRING"))?;
        i += 2;
        match escape {
            b'n' => out.push(b'\n'),
            b'r' => out.push(b'\r'),
            b't' => out.push(b'\t'),
            b'0' => out.push(0),
            b'\\' | b'\'' | b'"' => out.push(escape),
            b'x' => {
                let hex = body
                    .get(i..i + 2)
                    .and_then(|h| std::str::from_utf8(h).ok())
                    .and_then(|h| u8::from_str_radix(h, 16).ok())
                    .ok_or_else(|| DataError::format("bad \\x escape in STRING"))?;
                out.push(hex);
                i += 2;
            }
            other => {
                out.push(b'\\');
                out.push(other);
            }
        }
    }
    Ok(out)
}

/// Decode a protocol 0 `UNICODE` argument. Bytes stand for the latin-1
/// character of the same value; only `\uXXXX` and `\UXXXXXXXX` are escapes.
fn raw_unicode_unescape(line: &[u8]) -> Result<String> {
    let mut out = String::with_capacity(line.len());
    let mut i = 0;
    while i < line.len() {
        let digits = match (line[i], line.get(i + 1).copied()) {
            (b'\\', Some(b'u')) => 4,
            (b'\\', Some(b'U')) => 8,
            (byte, _) => {
                out.push(char::from(byte));
                i += 1;
                continue;
            }
        };
        let c = line
            .get(i + 2..i + 2 + digits)
            .and_then(|h| std::str::from_utf8(h).ok())
            .and_then(|h| u32::from_str_radix(h, 16).ok())
            .and_then(char::from_u32)
            .ok_or_else(|| DataError::format("bad unicode escape in UNICODE"))?;
        out.push(c);
        i += 2 + digits;
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// REDUCE and BUILD for the allowed callables
// ---------------------------------------------------------------------------

fn reduce(callable: &Value, args: &Value) -> Result<Value> {
    let (module, name) = match callable {
        Value::Global { module, name } => (module.as_str(), name.as_str()),
        other => {
            return Err(DataError::format(format!(
                "cannot call a {}",
                other.kind()
            )))
        }
    };
    let args = args
        .as_items()
        .ok_or_else(|| DataError::format("REDUCE arguments are not a tuple"))?;

    match (module, name) {
        ("numpy.core.multiarray" | "numpy._core.multiarray", "_reconstruct") => {
            Ok(Value::Array(Rc::new(NdArray::placeholder())))
        }
        ("numpy", "dtype") => {
            let descr = args
                .first()
                .and_then(Value::as_text)
                .ok_or_else(|| DataError::format("dtype without a type string"))?;
            Ok(Value::Dtype(Rc::new(Dtype::parse(&descr)?)))
        }
        ("numpy.core.numeric" | "numpy._core.numeric", "_frombuffer") => {
            let [buffer, dtype, shape, order] = args else {
                return Err(DataError::format("_frombuffer expects 4 arguments"));
            };
            let raw = buffer
                .to_raw_bytes()
                .ok_or_else(|| DataError::format("_frombuffer without a byte buffer"))?;
            let Value::Dtype(dtype) = dtype else {
                return Err(DataError::format("_frombuffer without a dtype"));
            };
            let fortran_order = order.as_text().as_deref() == Some("F");
            let array = NdArray::from_buffer(&raw, dtype, shape_of(shape)?, fortran_order)?;
            Ok(Value::Array(Rc::new(array)))
        }
        ("__builtin__" | "builtins", "bytes") if args.is_empty() => {
            Ok(Value::Bytes(Rc::new(Vec::new())))
        }
        ("_codecs", "encode") => {
            let text = args
                .first()
                .and_then(Value::as_text)
                .ok_or_else(|| DataError::format("_codecs.encode without text"))?;
            let encoding = args.get(1).and_then(Value::as_text).unwrap_or_default();
            if !matches!(encoding.as_str(), "latin1" | "latin-1" | "iso-8859-1") {
                return Err(DataError::format(format!(
                    "unsupported string encoding '{encoding}'"
                )));
            }
            let bytes = latin1_bytes(&text)
                .ok_or_else(|| DataError::format("text is not latin-1"))?;
            Ok(Value::Bytes(Rc::new(bytes)))
        }
        _ => Err(DataError::format(format!(
            "refusing to call {module}.{name}"
        ))),
    }
}

fn build(target: &Value, state: &Value) -> Result<Value> {
    match target {
        Value::Array(_) => Ok(Value::Array(Rc::new(NdArray::from_state(state)?))),
        Value::Dtype(dtype) => {
            // (version, byteorder, subdescr, names, fields, elsize, alignment, flags)
            let mut dtype = **dtype;
            let order = state
                .as_items()
                .and_then(|items| items.get(1))
                .and_then(Value::as_text);
            match order.as_deref() {
                Some(">") => dtype.little_endian = false,
                Some("<") => dtype.little_endian = true,
                _ => {}
            }
            Ok(Value::Dtype(Rc::new(dtype)))
        }
        other => Err(DataError::format(format!(
            "cannot set state on a {}",
            other.kind()
        ))),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Writes pickles the way NumPy does under protocol 2.
    pub(crate) struct PickleWriter {
        pub bytes: Vec<u8>,
        memo: u8,
    }

    impl PickleWriter {
        pub fn new() -> Self {
            PickleWriter {
                bytes: vec![0x80, 2],
                memo: 0,
            }
        }

        fn put(&mut self) -> u8 {
            let index = self.memo;
            self.bytes.extend([b'q', index]);
            self.memo += 1;
            index
        }

        fn short_string(&mut self, s: &[u8]) {
            self.bytes.push(b'U');
            self.bytes.push(s.len() as u8);
            self.bytes.extend_from_slice(s);
        }

        fn int(&mut self, v: usize) {
            match u16::try_from(v) {
                Ok(small) => {
                    self.bytes.push(b'M');
                    self.bytes.extend(small.to_le_bytes());
                }
                Err(_) => {
                    self.bytes.extend([0x8a, 8]);
                    self.bytes.extend((v as u64).to_le_bytes());
                }
            }
        }

        /// Pickle a dtype and return its memo index.
        pub fn dtype(&mut self, descr: &str, order: &str) -> u8 {
            self.bytes.extend(b"cnumpy\ndtype\n");
            self.put();
            self.short_string(descr.as_bytes());
            self.bytes.extend([b'K', 0, b'K', 1, 0x87]);
            self.put();
            self.bytes.extend([b'R']);
            let index = self.put();
            self.bytes.extend([b'(', b'K', 3]);
            self.short_string(order.as_bytes());
            self.bytes.extend([b'N', b'N', b'N']);
            self.bytes.extend([b'J', 0xff, 0xff, 0xff, 0xff]);
            self.bytes.extend([b'J', 0xff, 0xff, 0xff, 0xff]);
            self.bytes.extend([b'K', 0, b't', b'b']);
            // Leave the dtype in the memo only.
            self.bytes.push(b'0');
            index
        }

        /// Pickle an array whose dtype was pickled at memo `dtype`.
        pub fn array(&mut self, shape: &[usize], dtype: u8, raw: &[u8]) {
            self.array_head(shape, dtype);
            self.bytes.push(b'T');
            self.bytes.extend((raw.len() as u32).to_le_bytes());
            self.bytes.extend_from_slice(raw);
            self.bytes.extend([b't', b'b']);
        }

        /// An array without elements, its buffer written the way Python 3
        /// pickles `b''` below protocol 3.
        pub fn empty_array(&mut self, shape: &[usize], dtype: u8) {
            self.array_head(shape, dtype);
            self.bytes.extend(b"c__builtin__\nbytes\n)R");
            self.bytes.extend([b't', b'b']);
        }

        fn array_head(&mut self, shape: &[usize], dtype: u8) {
            self.bytes.extend(b"cnumpy.core.multiarray\n_reconstruct\n");
            self.put();
            self.bytes.extend(b"cnumpy\nndarray\n");
            self.put();
            self.bytes.extend([b'K', 0, 0x85]);
            self.short_string(b"b");
            self.bytes.push(0x87);
            self.bytes.push(b'R');
            self.put();
            self.bytes.extend([b'(', b'K', 1, b'(']);
            for &d in shape {
                self.int(d);
            }
            self.bytes.push(b't');
            self.bytes.extend([b'h', dtype]);
            self.bytes.push(0x89);
        }

        pub fn mark(&mut self) {
            self.bytes.push(b'(');
        }

        pub fn tuple(&mut self) {
            self.bytes.push(b't');
            self.put();
        }

        pub fn tuple2(&mut self) {
            self.bytes.push(0x86);
            self.put();
        }

        pub fn finish(mut self) -> Vec<u8> {
            self.bytes.push(b'.');
            self.bytes
        }
    }

    pub(crate) fn f32_bytes(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    pub(crate) fn i64_bytes(values: &[i64]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn decodes_numpy_arrays_sharing_a_dtype() {
        let mut w = PickleWriter::new();
        w.mark();
        let f4 = w.dtype("f4", "<");
        w.array(&[2, 3], f4, &f32_bytes(&[0.0, 0.5, 1.0, 0.25, 0.75, 1.0]));
        w.array(&[1, 2], f4, &f32_bytes(&[2.0, 3.0]));
        w.tuple();
        let value = from_reader(&w.finish()[..]).unwrap();

        let items = value.into_items().unwrap();
        assert_eq!(items.len(), 2);
        let mut items = items.into_iter();
        let first = items.next().unwrap().into_array().unwrap().into_matrix().unwrap();
        assert_eq!(first, ndarray::array![[0.0, 0.5, 1.0], [0.25, 0.75, 1.0]]);
        let second = items.next().unwrap().into_array().unwrap().into_matrix().unwrap();
        assert_eq!(second, ndarray::array![[2.0, 3.0]]);
    }

    #[test]
    fn decodes_int64_labels() {
        let mut w = PickleWriter::new();
        let i8 = w.dtype("i8", "<");
        w.array(&[4], i8, &i64_bytes(&[0, 1, 2, 9]));
        let labels = from_reader(&w.finish()[..])
            .unwrap()
            .into_array()
            .unwrap()
            .into_labels()
            .unwrap();
        assert_eq!(labels, vec![0, 1, 2, 9]);
    }

    #[test]
    fn big_endian_dtype_state_is_honoured() {
        let mut w = PickleWriter::new();
        let be = w.dtype("i4", ">");
        w.array(&[2], be, &[0, 0, 0, 7, 0, 0, 1, 0]);
        let labels = from_reader(&w.finish()[..])
            .unwrap()
            .into_array()
            .unwrap()
            .into_labels()
            .unwrap();
        assert_eq!(labels, vec![7, 256]);
    }

    #[test]
    fn fortran_order_is_transposed_into_rows() {
        let array = NdArray {
            shape: vec![2, 2],
            fortran_order: true,
            data: ArrayData::Float(vec![1.0, 3.0, 2.0, 4.0]),
        };
        assert_eq!(array.into_matrix().unwrap(), ndarray::array![[1.0, 2.0], [3.0, 4.0]]);
    }

    #[test]
    fn protocol_zero_scalars_and_containers() {
        let stream = b"(I1\nI00\nF0.5\nS'a\\x41\\n'\np0\ng0\nt.";
        let items = from_reader(&stream[..]).unwrap().into_items().unwrap();
        assert_eq!(items[0], Value::Int(1));
        assert_eq!(items[1], Value::Bool(false));
        assert_eq!(items[2], Value::Float(0.5));
        assert_eq!(items[3], Value::Bytes(Rc::new(b"aA\n".to_vec())));
        assert_eq!(items[4], items[3]);
    }

    #[test]
    fn python3_latin1_payload_is_reencoded() {
        let mut stream = vec![0x80, 2];
        stream.extend(b"c_codecs\nencode\n");
        stream.extend([b'X', 2, 0, 0, 0]);
        stream.extend("\u{ff}".as_bytes());
        stream.extend([b'X', 6, 0, 0, 0]);
        stream.extend(b"latin1");
        stream.extend([0x86, b'R', b'.']);
        let value = from_reader(&stream[..]).unwrap();
        assert_eq!(value, Value::Bytes(Rc::new(vec![0xff])));
    }

    #[test]
    fn rejects_arbitrary_callables() {
        let stream = b"\x80\x02cos\nsystem\nU\x02ls\x85R.";
        let err = from_reader(&stream[..]).unwrap_err();
        assert!(matches!(err, DataError::Format(msg) if msg.contains("os.system")));
    }

    #[test]
    fn truncated_stream_is_a_format_error() {
        let stream = b"\x80\x02T\x10\x00\x00\x00abc";
        assert!(matches!(
            from_reader(&stream[..]),
            Err(DataError::Format(_))
        ));
    }

    #[test]
    fn raw_size_must_match_shape() {
        let mut w = PickleWriter::new();
        let f4 = w.dtype("f4", "<");
        w.array(&[2, 2], f4, &f32_bytes(&[1.0]));
        assert!(matches!(
            from_reader(&w.finish()[..]),
            Err(DataError::Format(_))
        ));
    }

    #[test]
    fn parses_dtype_descriptors() {
        assert_eq!(
            Dtype::parse("<f8").unwrap(),
            Dtype {
                kind: 'f',
                size: 8,
                little_endian: true
            }
        );
        assert!(!Dtype::parse(">i2").unwrap().little_endian);
        assert!(Dtype::parse("c16").is_err());
        assert!(Dtype::parse("O").is_err());
    }

    // -- Streams in the shape Python 3 writes them --

    fn short_unicode(out: &mut Vec<u8>, text: &str) {
        out.push(0x8c);
        out.push(text.len() as u8);
        out.extend(text.as_bytes());
        out.push(0x94);
    }

    fn stack_global(out: &mut Vec<u8>, module: &str, name: &str) {
        short_unicode(out, module);
        short_unicode(out, name);
        out.extend([0x93, 0x94]);
    }

    /// `numpy.dtype(descr, False, True)` plus its little-endian state.
    fn framed_dtype(out: &mut Vec<u8>, descr: &str) {
        stack_global(out, "numpy", "dtype");
        short_unicode(out, descr);
        out.extend([0x89, 0x88, 0x87, 0x94, b'R', 0x94, b'(', b'K', 3]);
        out.push(0x8d);
        out.extend(1u64.to_le_bytes());
        out.push(b'<');
        out.extend([b'N', b'N', b'N']);
        out.extend([b'J', 0xff, 0xff, 0xff, 0xff, b'J', 0xff, 0xff, 0xff, 0xff]);
        out.extend([b'K', 0, b't', 0x94, b'b']);
    }

    fn framed_header(protocol: u8) -> Vec<u8> {
        let mut out = vec![0x80, protocol, 0x95];
        out.extend(0u64.to_le_bytes());
        out
    }

    #[test]
    fn protocol_four_array_with_stack_globals() {
        let mut s = framed_header(4);
        stack_global(&mut s, "numpy._core.multiarray", "_reconstruct");
        stack_global(&mut s, "numpy", "ndarray");
        s.extend([b'K', 0, 0x85, 0x94, b'C', 1, b'b', 0x94, 0x87, 0x94, b'R', 0x94]);
        s.extend([b'(', b'K', 1, b'K', 3, 0x85, 0x94]);
        framed_dtype(&mut s, "f8");
        s.push(0x89);
        let raw: Vec<u8> = [1.5f64, -2.0, 0.25].iter().flat_map(|v| v.to_le_bytes()).collect();
        s.push(0x8e);
        s.extend((raw.len() as u64).to_le_bytes());
        s.extend(&raw);
        s.extend([0x94, b't', 0x94, b'b', b'.']);

        let array = from_reader(&s[..]).unwrap().into_array().unwrap();
        assert_eq!(
            array,
            NdArray {
                shape: vec![3],
                fortran_order: false,
                data: ArrayData::Float(vec![1.5, -2.0, 0.25]),
            }
        );
    }

    #[test]
    fn protocol_five_frombuffer_in_fortran_order() {
        let mut s = framed_header(5);
        stack_global(&mut s, "numpy._core.numeric", "_frombuffer");
        s.push(b'(');
        let raw: Vec<u8> = [1i32, 3, 2, 4].iter().flat_map(|v| v.to_le_bytes()).collect();
        s.push(0x96);
        s.extend((raw.len() as u64).to_le_bytes());
        s.extend(&raw);
        s.push(0x98);
        framed_dtype(&mut s, "i4");
        s.extend([b'K', 2, b'K', 2, 0x86, 0x94]);
        short_unicode(&mut s, "F");
        s.extend([b't', 0x94, b'R', 0x94, b'.']);

        let matrix = from_reader(&s[..])
            .unwrap()
            .into_array()
            .unwrap()
            .into_matrix()
            .unwrap();
        assert_eq!(matrix, ndarray::array![[1.0, 2.0], [3.0, 4.0]]);
    }

    #[test]
    fn protocol_zero_array_from_python3() {
        let mut s = Vec::new();
        s.extend(b"cnumpy.core.multiarray\n_reconstruct\np0\n");
        s.extend(b"(cnumpy\nndarray\np1\n(I0\ntp2\n");
        s.extend(b"c_codecs\nencode\np3\n(Vb\np4\nVlatin1\np5\ntp6\nRp7\ntp8\nRp9\n");
        s.extend(b"(I1\n(I2\ntp10\n");
        s.extend(b"cnumpy\ndtype\np11\n(Vi1\np12\nI00\nI01\ntp13\nRp14\n");
        s.extend(b"(I3\nV|\np15\nNNNI-1\nI-1\nI0\ntp16\nb");
        s.extend(b"I00\n");
        s.extend(b"c_codecs\nencode\np17\n(V\xff\\u005c\np18\nVlatin1\np19\ntp20\nRp21\n");
        s.extend(b"tp22\nb.");

        let labels = from_reader(&s[..])
            .unwrap()
            .into_array()
            .unwrap()
            .into_labels()
            .unwrap();
        assert_eq!(labels, vec![-1, 92]);
    }

    #[test]
    fn unicode_escapes_decode() {
        assert_eq!(raw_unicode_unescape(b"a\\u00e9\\U0001F600\xe9").unwrap(), "a\u{e9}\u{1F600}\u{e9}");
        assert_eq!(raw_unicode_unescape(b"back\\slash").unwrap(), "back\\slash");
        assert!(raw_unicode_unescape(b"\\u12").is_err());
    }

    #[test]
    fn empty_bytes_call_gives_an_empty_buffer() {
        let stream = b"\x80\x02c__builtin__\nbytes\n)R.";
        assert_eq!(from_reader(&stream[..]).unwrap(), Value::Bytes(Rc::new(Vec::new())));

        let mut w = PickleWriter::new();
        let i8 = w.dtype("i8", "<");
        w.empty_array(&[0], i8);
        let labels = from_reader(&w.finish()[..])
            .unwrap()
            .into_array()
            .unwrap()
            .into_labels()
            .unwrap();
        assert!(labels.is_empty());

        let with_args = b"\x80\x02cbuiltins\nbytes\nK\x01\x85R.";
        assert!(matches!(from_reader(&with_args[..]), Err(DataError::Format(_))));
    }

    #[test]
    fn oversized_shape_is_a_format_error() {
        let mut w = PickleWriter::new();
        let f4 = w.dtype("f4", "<");
        w.array(&[1 << 32, 1 << 32], f4, &[0; 4]);
        let err = from_reader(&w.finish()[..]).unwrap_err();
        assert!(matches!(err, DataError::Format(msg) if msg.contains("overflows")));

        let mut w = PickleWriter::new();
        let f4 = w.dtype("f4", "<");
        w.array(&[1 << 62], f4, &[0; 4]);
        let err = from_reader(&w.finish()[..]).unwrap_err();
        assert!(matches!(err, DataError::Format(msg) if msg.contains("overflows")));
    }
}
