use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt};
use flate2::read::GzDecoder;
use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, ShapeBuilder};
use std::{
    fs,
    io::{Cursor, Read},
    path::Path,
};

use crate::error::{DatasetError, PickleError};
use crate::pickle::{self, Node, NodeId, Pickle, StringEncoding};
use crate::Float;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const IDX_LABELS_MAGIC: i32 = 2049;
const IDX_IMAGES_MAGIC: i32 = 2051;

// 60 000 IDX training rows -> 50 000 train / 10 000 validation, as in mnist.pkl.gz
const VALIDATION_FRACTION: usize = 6;

/// One split of the dataset: a feature matrix (one row per sample) and the
/// row-aligned labels.
///
/// Labels arrive at the feature precision and are cast once to `i32` class
/// indices; their values are not range-checked.
#[derive(Debug, Clone)]
pub struct Split {
    name: &'static str,
    features: Array2<Float>,
    label_indices: Array1<i32>,
}

impl Split {
    pub fn new(
        name: &'static str,
        features: Array2<Float>,
        labels: Array1<Float>,
    ) -> Result<Self, DatasetError> {
        if features.nrows() != labels.len() {
            return Err(DatasetError::LengthMismatch {
                split: name,
                features: features.nrows(),
                labels: labels.len(),
            });
        }
        let label_indices = labels.mapv(|y| y as i32);
        Ok(Split {
            name,
            features,
            label_indices,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn len(&self) -> usize {
        self.features.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn n_features(&self) -> usize {
        self.features.ncols()
    }

    pub fn features(&self) -> ArrayView2<'_, Float> {
        self.features.view()
    }

    pub fn label_indices(&self) -> ArrayView1<'_, i32> {
        self.label_indices.view()
    }

    /// Number of complete minibatches; a trailing partial batch is dropped.
    pub fn n_batches(&self, batch_size: usize) -> usize {
        if batch_size == 0 || self.is_empty() {
            0
        } else {
            self.len() / batch_size
        }
    }

    /// Rows `[index * batch_size, (index + 1) * batch_size)`.
    pub fn minibatch(
        &self,
        index: usize,
        batch_size: usize,
    ) -> Option<(ArrayView2<'_, Float>, ArrayView1<'_, i32>)> {
        if index >= self.n_batches(batch_size) {
            return None;
        }
        let start = index * batch_size;
        let end = start + batch_size;
        Some((
            self.features().slice_move(s![start..end, ..]),
            self.label_indices().slice_move(s![start..end]),
        ))
    }
}

/// The train, validation and test splits, in that order.
#[derive(Debug, Clone)]
pub struct MnistData {
    pub train: Split,
    pub valid: Split,
    pub test: Split,
}

impl MnistData {
    pub fn splits(&self) -> [&Split; 3] {
        [&self.train, &self.valid, &self.test]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetFormat {
    Pickle { protocol: u8 },
    Idx,
}

/// Identifies decompressed dataset contents by their leading bytes.
pub fn detect_format(contents: &[u8]) -> Result<DatasetFormat, DatasetError> {
    match contents {
        // PROTO opcode
        [0x80, protocol @ 2..=5, ..] => Ok(DatasetFormat::Pickle {
            protocol: *protocol,
        }),
        [0x80, protocol, ..] => Err(PickleError::UnsupportedProtocol(*protocol).into()),
        [0x00, 0x00, 0x08, _, ..] => Ok(DatasetFormat::Idx),
        _ => Err(DatasetError::UnknownFormat {
            magic: contents.iter().take(4).copied().collect(),
        }),
    }
}

/// Loads the three splits from a (possibly gzip-compressed) NumPy pickle of
/// `((train_x, train_y), (valid_x, valid_y), (test_x, test_y))`, or from a
/// directory of MNIST IDX files.
pub fn load_data(path: &Path) -> Result<MnistData, DatasetError> {
    tracing::info!(path = %path.display(), "loading dataset");
    let data = if path.is_dir() {
        load_idx_directory(path)?
    } else {
        let contents = read_contents(path)?;
        match detect_format(&contents)? {
            DatasetFormat::Pickle { protocol } => {
                let encoding = StringEncoding::for_protocol(protocol);
                tracing::debug!(protocol, ?encoding, "decoding pickle");
                load_pickle(&contents, encoding)?
            }
            DatasetFormat::Idx => {
                return Err(DatasetError::Layout(
                    "a single IDX file holds one array; \
                     pass the directory holding the train and t10k files"
                        .into(),
                ))
            }
        }
    };

    for split in data.splits() {
        tracing::info!(
            split = split.name(),
            rows = split.len(),
            features = split.n_features(),
            "loaded split"
        );
    }
    let width = data.train.n_features();
    if let Some(split) = data.splits().into_iter().find(|s| s.n_features() != width) {
        return Err(DatasetError::Layout(format!(
            "{} split has {} features per row, train has {width}",
            split.name(),
            split.n_features()
        )));
    }
    Ok(data)
}

fn read_contents(path: &Path) -> Result<Vec<u8>, DatasetError> {
    let raw = fs::read(path)?;
    if !raw.starts_with(&GZIP_MAGIC) {
        return Ok(raw);
    }
    let mut gz = GzDecoder::new(&raw[..]);
    let mut contents: Vec<u8> = Vec::new();
    gz.read_to_end(&mut contents)?;
    Ok(contents)
}

fn load_pickle(contents: &[u8], encoding: StringEncoding) -> Result<MnistData, DatasetError> {
    let pickle = pickle::decode(contents, encoding)?;
    tracing::debug!(protocol = pickle.protocol(), "decoded pickle");
    let splits = match pickle.tuple(pickle.root()) {
        Some(splits) if splits.len() == 3 => splits,
        _ => {
            return Err(DatasetError::Layout(
                "expected a (train, valid, test) tuple".into(),
            ))
        }
    };
    Ok(MnistData {
        train: split_from_pickle(&pickle, "train", splits[0])?,
        valid: split_from_pickle(&pickle, "valid", splits[1])?,
        test: split_from_pickle(&pickle, "test", splits[2])?,
    })
}

fn split_from_pickle(
    pickle: &Pickle,
    name: &'static str,
    id: NodeId,
) -> Result<Split, DatasetError> {
    let pair = match pickle.tuple(id) {
        Some(pair) if pair.len() == 2 => pair,
        _ => {
            return Err(DatasetError::Layout(format!(
                "{name} split is not a (features, labels) pair"
            )))
        }
    };
    let features = NumpyArray::from_pickle(pickle, pair[0])?;
    let labels = NumpyArray::from_pickle(pickle, pair[1])?;

    let features = match features.shape[..] {
        [rows, cols] => {
            let shape = (rows, cols).set_f(features.fortran_order);
            Array2::from_shape_vec(shape, features.values)?
                .as_standard_layout()
                .into_owned()
        }
        _ => {
            return Err(DatasetError::Layout(format!(
                "{name} features have shape {:?}, expected (rows, features)",
                features.shape
            )))
        }
    };
    let labels = match labels.shape[..] {
        [_] => Array1::from_vec(labels.values),
        _ => {
            return Err(DatasetError::Layout(format!(
                "{name} labels have shape {:?}, expected (rows,)",
                labels.shape
            )))
        }
    };
    Split::new(name, features, labels)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endian {
    Little,
    Big,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Dtype {
    kind: char,
    size: usize,
    endian: Endian,
}

impl Dtype {
    fn parse(descr: &str, order: Option<&str>) -> Result<Self, DatasetError> {
        let unsupported = || DatasetError::UnsupportedDtype(descr.to_string());
        let (order, rest) = match descr.chars().next() {
            Some(c @ ('<' | '>' | '|' | '=')) => (Some(c), &descr[1..]),
            _ => (order.and_then(|o| o.chars().next()), descr),
        };
        let mut chars = rest.chars();
        let kind = chars.next().ok_or_else(unsupported)?;
        let size: usize = chars.as_str().parse().map_err(|_| unsupported())?;
        let endian = match order {
            Some('>') => Endian::Big,
            Some('<') => Endian::Little,
            _ if cfg!(target_endian = "big") => Endian::Big,
            _ => Endian::Little,
        };
        Ok(Dtype { kind, size, endian })
    }

    fn from_pickle(pickle: &Pickle, id: NodeId) -> Result<Self, DatasetError> {
        let (args, state) = match (pickle.constructor(id), pickle.node(id)) {
            (Some((_, "dtype")), Node::Object { args, state, .. }) => (*args, *state),
            _ => return Err(DatasetError::Layout("expected a numpy dtype".into())),
        };
        let descr = pickle
            .tuple(args)
            .and_then(|args| args.first())
            .and_then(|&descr| pickle.text(descr))
            .ok_or_else(|| {
                DatasetError::Layout("numpy dtype without a type string".into())
            })?;
        let order = state
            .and_then(|state| pickle.tuple(state))
            .and_then(|state| state.get(1))
            .and_then(|&order| pickle.text(order));
        Dtype::parse(&descr, order.as_deref())
    }

    fn decode(&self, raw: &[u8]) -> Result<Vec<Float>, DatasetError> {
        if self.size == 0 || raw.len() % self.size != 0 {
            return Err(DatasetError::Layout(format!(
                "{} data bytes do not divide into {}-byte elements",
                raw.len(),
                self.size
            )));
        }
        let values = match self.endian {
            Endian::Little => decode_elements::<LittleEndian>(self.kind, self.size, raw),
            Endian::Big => decode_elements::<BigEndian>(self.kind, self.size, raw),
        };
        values.ok_or_else(|| {
            DatasetError::UnsupportedDtype(format!("{}{}", self.kind, self.size))
        })
    }
}

fn decode_elements<B: ByteOrder>(kind: char, size: usize, raw: &[u8]) -> Option<Vec<Float>> {
    let chunks = raw.chunks_exact(size);
    let values = match (kind, size) {
        ('f', 4) => chunks.map(|c| B::read_f32(c) as Float).collect(),
        ('f', 8) => chunks.map(|c| B::read_f64(c) as Float).collect(),
        ('i', 1) => chunks.map(|c| c[0] as i8 as Float).collect(),
        ('i', 2) => chunks.map(|c| B::read_i16(c) as Float).collect(),
        ('i', 4) => chunks.map(|c| B::read_i32(c) as Float).collect(),
        ('i', 8) => chunks.map(|c| B::read_i64(c) as Float).collect(),
        ('u', 1) | ('b', 1) => chunks.map(|c| c[0] as Float).collect(),
        ('u', 2) => chunks.map(|c| B::read_u16(c) as Float).collect(),
        ('u', 4) => chunks.map(|c| B::read_u32(c) as Float).collect(),
        ('u', 8) => chunks.map(|c| B::read_u64(c) as Float).collect(),
        _ => return None,
    };
    Some(values)
}

#[derive(Debug)]
struct NumpyArray {
    shape: Vec<usize>,
    fortran_order: bool,
    values: Vec<Float>,
}

impl NumpyArray {
    fn from_pickle(pickle: &Pickle, id: NodeId) -> Result<Self, DatasetError> {
        match pickle.constructor(id) {
            Some((module, "_reconstruct")) if module.starts_with("numpy") => {
                Self::from_reconstruct(pickle, id)
            }
            Some((module, "_frombuffer")) if module.starts_with("numpy") => {
                Self::from_frombuffer(pickle, id)
            }
            _ => Err(DatasetError::Layout("expected a numpy array".into())),
        }
    }

    /// `_reconstruct(ndarray, (0,), b'b')` followed by
    /// `BUILD (version, shape, dtype, is_fortran, data)`.
    fn from_reconstruct(pickle: &Pickle, id: NodeId) -> Result<Self, DatasetError> {
        let state = match pickle.node(id) {
            Node::Object { state: Some(state), .. } => pickle.tuple(*state),
            _ => None,
        };
        let state = match state {
            Some(state) if state.len() == 5 => &state[1..],
            Some(state) if state.len() == 4 => state,
            _ => {
                return Err(DatasetError::Layout(
                    "numpy array without array state".into(),
                ))
            }
        };
        let fortran_order = pickle
            .bool(state[2])
            .ok_or_else(|| {
                DatasetError::Layout("numpy array order flag is not a bool".into())
            })?;
        Self::assemble(pickle, state[0], state[1], state[3], fortran_order)
    }

    /// Protocol 5 form: `_frombuffer(buffer, dtype, shape, order)`.
    fn from_frombuffer(pickle: &Pickle, id: NodeId) -> Result<Self, DatasetError> {
        let args = match pickle.node(id) {
            Node::Object { args, .. } => pickle.tuple(*args),
            _ => None,
        };
        let args = match args {
            Some(args) if args.len() == 4 => args,
            _ => {
                return Err(DatasetError::Layout(
                    "malformed numpy _frombuffer call".into(),
                ))
            }
        };
        let fortran_order = pickle.text(args[3]).as_deref() == Some("F");
        Self::assemble(pickle, args[2], args[1], args[0], fortran_order)
    }

    fn assemble(
        pickle: &Pickle,
        shape: NodeId,
        dtype: NodeId,
        data: NodeId,
        fortran_order: bool,
    ) -> Result<Self, DatasetError> {
        let shape = pickle
            .tuple(shape)
            .and_then(|dims| {
                dims.iter()
                    .map(|&dim| pickle.int(dim).and_then(|d| usize::try_from(d).ok()))
                    .collect::<Option<Vec<usize>>>()
            })
            .ok_or_else(|| {
                DatasetError::Layout("numpy array shape is not a tuple of sizes".into())
            })?;
        let dtype = Dtype::from_pickle(pickle, dtype)?;
        let raw = pickle
            .bytes(data)
            .ok_or_else(|| {
                DatasetError::Layout("numpy array data is not a byte string".into())
            })?;
        let values = dtype.decode(&raw)?;
        let expected = element_count(&shape).ok_or_else(|| {
            DatasetError::Layout(format!("numpy array shape {shape:?} overflows"))
        })?;
        if values.len() != expected {
            return Err(DatasetError::Layout(format!(
                "numpy array of shape {shape:?} carries {} elements",
                values.len()
            )));
        }
        Ok(NumpyArray {
            shape,
            fortran_order,
            values,
        })
    }
}

fn element_count(dims: &[usize]) -> Option<usize> {
    dims.iter().try_fold(1usize, |count, &dim| count.checked_mul(dim))
}

#[derive(Debug)]
struct IdxRawData {
    sizes: Vec<usize>,
    data: Vec<u8>,
}

impl IdxRawData {
    fn new(contents: &[u8]) -> Result<IdxRawData, DatasetError> {
        let mut r = Cursor::new(contents);

        let magic_number = r.read_i32::<BigEndian>()?;
        let dims = match magic_number {
            IDX_LABELS_MAGIC => 1,
            IDX_IMAGES_MAGIC => 3,
            other => {
                return Err(DatasetError::Idx(format!(
                    "unknown magic number {other}"
                )))
            }
        };

        let mut sizes: Vec<usize> = Vec::with_capacity(dims);
        for _ in 0..dims {
            sizes.push(r.read_u32::<BigEndian>()? as usize);
        }

        let mut data: Vec<u8> = Vec::new();
        r.read_to_end(&mut data)?;

        let expected = element_count(&sizes)
            .ok_or_else(|| DatasetError::Idx(format!("header sizes {sizes:?} overflow")))?;
        if data.len() != expected {
            return Err(DatasetError::Idx(format!(
                "header announces {expected} values, file holds {}",
                data.len()
            )));
        }

        Ok(IdxRawData { sizes, data })
    }

    /// Opens `<dir>/<stem>` or `<dir>/<stem>.gz`.
    fn open(dir: &Path, stem: &str) -> Result<IdxRawData, DatasetError> {
        let plain = dir.join(stem);
        let gz = dir.join(format!("{stem}.gz"));
        let path = if plain.is_file() {
            plain
        } else if gz.is_file() {
            gz
        } else {
            return Err(DatasetError::MissingIdxFile(gz));
        };
        IdxRawData::new(&read_contents(&path)?)
    }
}

fn load_idx_pair(
    dir: &Path,
    dataset_name: &str,
) -> Result<(Array2<Float>, Array1<Float>), DatasetError> {
    let label_data = IdxRawData::open(dir, &format!("{dataset_name}-labels-idx1-ubyte"))?;
    let images_data = IdxRawData::open(dir, &format!("{dataset_name}-images-idx3-ubyte"))?;
    if label_data.sizes.len() != 1 || images_data.sizes.len() != 3 {
        return Err(DatasetError::Idx(format!(
            "{dataset_name} label and image files are swapped or mislabelled"
        )));
    }
    let image_shape = images_data.sizes[1] * images_data.sizes[2];

    let pixels: Vec<Float> = images_data
        .data
        .iter()
        .map(|&x| Float::from(x) / 255.)
        .collect();
    let inputs = Array2::from_shape_vec((images_data.sizes[0], image_shape), pixels)?;
    let labels: Array1<Float> = label_data
        .data
        .iter()
        .map(|&label| Float::from(label))
        .collect();
    Ok((inputs, labels))
}

fn load_idx_directory(dir: &Path) -> Result<MnistData, DatasetError> {
    let (train_x, train_y) = load_idx_pair(dir, "train")?;
    let (test_x, test_y) = load_idx_pair(dir, "t10k")?;

    if train_x.nrows() != train_y.len() {
        return Err(DatasetError::LengthMismatch {
            split: "train",
            features: train_x.nrows(),
            labels: train_y.len(),
        });
    }
    let cut = train_x.nrows() - train_x.nrows() / VALIDATION_FRACTION;
    let train = Split::new(
        "train",
        train_x.slice(s![..cut, ..]).to_owned(),
        train_y.slice(s![..cut]).to_owned(),
    )?;
    let valid = Split::new(
        "valid",
        train_x.slice(s![cut.., ..]).to_owned(),
        train_y.slice(s![cut..]).to_owned(),
    )?;
    let test = Split::new("test", test_x, test_y)?;
    Ok(MnistData { train, valid, test })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use flate2::{write::GzEncoder, Compression};
    use ndarray::array;
    use std::io::Write;

    // Emits pickles the way NumPy does: `_reconstruct` + `BUILD` at protocol 2,
    // `_frombuffer` inside a frame at protocol 5.
    struct PickleWriter {
        out: Vec<u8>,
        next_memo: u8,
        framed: bool,
    }

    enum DtypeRef<'a> {
        New(&'a str),
        Memo(u8),
    }

    enum Payload<'a> {
        Bytes(&'a [u8]),
        ByteArray(&'a [u8]),
    }

    impl PickleWriter {
        fn new(protocol: u8) -> Self {
            let mut out = vec![0x80, protocol];
            let framed = protocol >= 4;
            if framed {
                out.push(0x95);
                out.extend_from_slice(&[0; 8]);
            }
            PickleWriter {
                out,
                next_memo: 0,
                framed,
            }
        }

        fn op(&mut self, bytes: &[u8]) -> &mut Self {
            self.out.extend_from_slice(bytes);
            self
        }

        fn global(&mut self, module: &str, name: &str) -> &mut Self {
            self.op(b"c").op(module.as_bytes()).op(b"\n").op(name.as_bytes()).op(b"\n")
        }

        fn short_str(&mut self, s: &[u8]) -> &mut Self {
            self.op(b"U").op(&[s.len() as u8]).op(s)
        }

        fn int(&mut self, value: i64) -> &mut Self {
            match value {
                0..=255 => self.op(&[b'K', value as u8]),
                256..=65535 => {
                    let bytes = (value as u16).to_le_bytes();
                    self.op(b"M").op(&bytes)
                }
                _ => {
                    let bytes = (value as i32).to_le_bytes();
                    self.op(b"J").op(&bytes)
                }
            }
        }

        fn put(&mut self) -> u8 {
            let key = self.next_memo;
            self.next_memo += 1;
            self.op(&[b'q', key]);
            key
        }

        fn get(&mut self, key: u8) -> &mut Self {
            self.op(&[b'h', key])
        }

        fn memoize(&mut self) -> u8 {
            let key = self.next_memo;
            self.next_memo += 1;
            self.op(&[0x94]);
            key
        }

        fn unicode(&mut self, s: &str) -> &mut Self {
            self.op(&[0x8c, s.len() as u8]).op(s.as_bytes())
        }

        fn stack_global(&mut self, module: &str, name: &str) -> &mut Self {
            self.unicode(module).memoize();
            self.unicode(name).memoize();
            self.op(&[0x93]).memoize();
            self
        }

        fn dtype(&mut self, descr: DtypeRef<'_>) -> u8 {
            match descr {
                DtypeRef::Memo(key) => {
                    self.get(key);
                    key
                }
                DtypeRef::New(descr) => {
                    self.global("numpy", "dtype");
                    self.short_str(descr.as_bytes()).int(0).int(1).op(&[0x87, b'R']);
                    let key = self.put();
                    self.op(b"(").int(3).short_str(b"<").op(b"NNN").int(-1).int(-1).int(0);
                    self.op(b"tb");
                    key
                }
            }
        }

        fn framed_dtype(&mut self, descr: DtypeRef<'_>) -> u8 {
            match descr {
                DtypeRef::Memo(key) => {
                    self.get(key);
                    key
                }
                DtypeRef::New(descr) => {
                    self.stack_global("numpy", "dtype");
                    self.unicode(descr).op(&[0x89, 0x88, 0x87, b'R']);
                    let key = self.memoize();
                    self.op(b"(").int(3).unicode("<").op(b"NNN");
                    self.int(-1).int(-1).int(0).op(b"tb");
                    key
                }
            }
        }

        fn array(
            &mut self,
            shape: &[usize],
            dtype: DtypeRef<'_>,
            fortran: bool,
            raw: &[u8],
        ) -> u8 {
            self.global("numpy.core.multiarray", "_reconstruct");
            self.global("numpy", "ndarray");
            self.int(0).op(&[0x85]).short_str(b"b").op(&[0x87, b'R']);
            self.put();
            self.op(b"(").int(1).op(b"(");
            for &dim in shape {
                self.int(dim as i64);
            }
            self.op(b"t");
            let key = self.dtype(dtype);
            self.op(&[if fortran { 0x88 } else { 0x89 }]);
            self.op(b"T").op(&(raw.len() as i32).to_le_bytes()).op(raw);
            self.op(b"tb");
            key
        }

        // _frombuffer(buffer, dtype, shape, order)
        fn frombuffer(
            &mut self,
            shape: &[usize],
            dtype: DtypeRef<'_>,
            order: &str,
            data: Payload<'_>,
        ) -> u8 {
            self.stack_global("numpy.core.numeric", "_frombuffer");
            self.op(b"(");
            match data {
                Payload::Bytes(raw) => {
                    self.op(b"B").op(&(raw.len() as u32).to_le_bytes()).op(raw)
                }
                Payload::ByteArray(raw) => {
                    self.op(&[0x96]).op(&(raw.len() as u64).to_le_bytes()).op(raw)
                }
            };
            self.memoize();
            let key = self.framed_dtype(dtype);
            self.op(b"(");
            for &dim in shape {
                self.int(dim as i64);
            }
            self.op(b"t").unicode(order).op(b"tR");
            self.memoize();
            key
        }

        fn finish(mut self) -> Vec<u8> {
            self.op(b".");
            if self.framed {
                let frame_len = (self.out.len() - 11) as u64;
                self.out[3..11].copy_from_slice(&frame_len.to_le_bytes());
            }
            self.out
        }
    }

    fn f32_bytes(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn i64_bytes(values: &[i64]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// `((x, y), (x, y), (x, y))` with 2 features per row; the float dtype is
    /// written once and recalled from the memo afterwards.
    fn mnist_like_pickle(splits: &[(Vec<f32>, Vec<i64>); 3], fortran: bool) -> Vec<u8> {
        let mut w = PickleWriter::new(2);
        let mut float_dtype = None;
        let mut int_dtype = None;
        for (features, labels) in splits {
            let x_dtype = float_dtype.map_or(DtypeRef::New("f4"), DtypeRef::Memo);
            let shape = [features.len() / 2, 2];
            float_dtype = Some(w.array(&shape, x_dtype, fortran, &f32_bytes(features)));
            let y_dtype = int_dtype.map_or(DtypeRef::New("i8"), DtypeRef::Memo);
            int_dtype = Some(w.array(&[labels.len()], y_dtype, false, &i64_bytes(labels)));
            w.op(&[0x86]);
        }
        w.op(&[0x87]);
        w.finish()
    }

    /// Protocol 5 counterpart of [`mnist_like_pickle`]: features travel as
    /// `bytes`, labels as a `bytearray`.
    fn frombuffer_pickle(splits: &[(Vec<f32>, Vec<i64>); 3], order: &str) -> Vec<u8> {
        let mut w = PickleWriter::new(5);
        let mut float_dtype = None;
        let mut int_dtype = None;
        for (features, labels) in splits {
            let x_dtype = float_dtype.map_or(DtypeRef::New("f4"), DtypeRef::Memo);
            let shape = [features.len() / 2, 2];
            let x = f32_bytes(features);
            float_dtype = Some(w.frombuffer(&shape, x_dtype, order, Payload::Bytes(&x)));
            let y_dtype = int_dtype.map_or(DtypeRef::New("i8"), DtypeRef::Memo);
            let y_bytes = i64_bytes(labels);
            let y = Payload::ByteArray(&y_bytes);
            int_dtype = Some(w.frombuffer(&[labels.len()], y_dtype, "C", y));
            w.op(&[0x86]);
        }
        w.op(&[0x87]);
        w.finish()
    }

    fn gzip(bytes: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(bytes).unwrap();
        encoder.finish().unwrap()
    }

    fn write_temp(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        file.flush().unwrap();
        file
    }

    fn sample_splits() -> [(Vec<f32>, Vec<i64>); 3] {
        [
            (vec![0.0, 0.1, 0.2, 0.3, 0.4, 0.5], vec![7, 2, 1]),
            (vec![0.6, 0.7], vec![4]),
            (vec![0.8, 0.9, 1.0, 0.25], vec![9, 0]),
        ]
    }

    #[test]
    fn split_rejects_length_mismatch() {
        let err =
            Split::new("train", Array2::zeros((3, 2)), Array1::zeros(2)).unwrap_err();
        assert!(matches!(
            err,
            DatasetError::LengthMismatch {
                split: "train",
                features: 3,
                labels: 2
            }
        ));
    }

    #[test]
    fn split_casts_labels_to_indices() {
        let split =
            Split::new("test", Array2::zeros((3, 1)), array![3.0, 0.0, 9.0]).unwrap();
        assert_eq!(split.label_indices().to_vec(), vec![3, 0, 9]);
    }

    #[test]
    fn minibatches_are_contiguous_and_drop_the_tail() {
        let features = Array2::from_shape_fn((7, 2), |(r, c)| (r * 2 + c) as Float);
        let labels = Array1::from_shape_fn(7, |r| r as Float);
        let split = Split::new("train", features, labels).unwrap();

        assert_eq!(split.n_batches(3), 2);
        assert_eq!(split.n_batches(0), 0);
        let (x, y) = split.minibatch(1, 3).unwrap();
        assert_eq!(x, array![[6.0f32, 7.0], [8.0, 9.0], [10.0, 11.0]]);
        assert_eq!(y.to_vec(), vec![3, 4, 5]);
        assert!(split.minibatch(2, 3).is_none());
    }

    #[test]
    fn detects_formats_by_leading_bytes() {
        assert_eq!(
            detect_format(&[0x80, 2, b'(']).unwrap(),
            DatasetFormat::Pickle { protocol: 2 }
        );
        assert_eq!(
            detect_format(&[0x80, 4]).unwrap(),
            DatasetFormat::Pickle { protocol: 4 }
        );
        assert_eq!(detect_format(&[0, 0, 8, 3, 0]).unwrap(), DatasetFormat::Idx);
        assert!(matches!(
            detect_format(&[0x80, 7]),
            Err(DatasetError::Pickle(PickleError::UnsupportedProtocol(7)))
        ));
        assert!(matches!(
            detect_format(b"(lp0"),
            Err(DatasetError::UnknownFormat { magic }) if magic == b"(lp0".to_vec()
        ));
    }

    #[test]
    fn loads_gzipped_numpy_pickle_in_order() {
        let file = write_temp(&gzip(&mnist_like_pickle(&sample_splits(), false)));
        let data = load_data(file.path()).unwrap();

        assert_eq!(data.train.len(), 3);
        assert_eq!(data.valid.len(), 1);
        assert_eq!(data.test.len(), 2);
        for split in data.splits() {
            assert_eq!(split.features().nrows(), split.label_indices().len());
            assert_eq!(split.n_features(), 2);
        }
        assert_eq!(data.train.label_indices().to_vec(), vec![7, 2, 1]);
        assert_abs_diff_eq!(data.train.features()[[1, 0]], 0.2);
        assert_abs_diff_eq!(data.train.features()[[2, 1]], 0.5);
        // recalled dtype still carries its byte order
        assert_abs_diff_eq!(data.test.features()[[1, 1]], 0.25);
        assert_eq!(data.test.label_indices().to_vec(), vec![9, 0]);
    }

    #[test]
    fn loads_uncompressed_pickle() {
        let file = write_temp(&mnist_like_pickle(&sample_splits(), false));
        let data = load_data(file.path()).unwrap();
        assert_eq!(data.valid.label_indices().to_vec(), vec![4]);
        assert_abs_diff_eq!(data.valid.features()[[0, 1]], 0.7);
    }

    #[test]
    fn loads_protocol5_frombuffer_pickle() {
        let file = write_temp(&gzip(&frombuffer_pickle(&sample_splits(), "C")));
        let data = load_data(file.path()).unwrap();

        assert_eq!(data.train.len(), 3);
        assert_eq!(data.train.label_indices().to_vec(), vec![7, 2, 1]);
        assert_abs_diff_eq!(data.train.features()[[1, 0]], 0.2);
        assert_eq!(data.valid.label_indices().to_vec(), vec![4]);
        // dtypes recalled through BINGET after MEMOIZE
        assert_abs_diff_eq!(data.test.features()[[1, 1]], 0.25);
        assert_eq!(data.test.label_indices().to_vec(), vec![9, 0]);
    }

    #[test]
    fn fortran_ordered_features_are_stored_row_major() {
        let pickled = [
            mnist_like_pickle(&sample_splits(), true),
            frombuffer_pickle(&sample_splits(), "F"),
        ];
        for bytes in pickled {
            let file = write_temp(&bytes);
            let data = load_data(file.path()).unwrap();

            // storage [0.0, 0.1, 0.2, 0.3, 0.4, 0.5] read column by column
            assert_eq!(
                data.train.features(),
                array![[0.0f32, 0.3], [0.1, 0.4], [0.2, 0.5]]
            );
            assert!(data.train.features().is_standard_layout());
            let (x, y) = data.train.minibatch(1, 1).unwrap();
            assert_eq!(x, array![[0.1f32, 0.4]]);
            assert_eq!(y.to_vec(), vec![2]);
            assert_abs_diff_eq!(data.test.features()[[0, 1]], 1.0);
        }
    }

    #[test]
    fn overflowing_array_shape_is_a_layout_error() {
        let big = i32::MAX as usize;
        let mut w = PickleWriter::new(2);
        w.array(&[big, big, big], DtypeRef::New("f4"), false, &[]);
        let pickle = pickle::decode(&w.finish(), StringEncoding::Latin1).unwrap();
        match NumpyArray::from_pickle(&pickle, pickle.root()) {
            Err(DatasetError::Layout(message)) => {
                assert!(message.contains("overflows"))
            }
            other => panic!("expected a layout error, got {other:?}"),
        }
    }

    #[test]
    fn mismatched_pickle_split_fails() {
        let mut splits = sample_splits();
        splits[1].1 = vec![4, 5];
        let file = write_temp(&gzip(&mnist_like_pickle(&splits, false)));
        let err = load_data(file.path()).unwrap_err();
        assert!(matches!(
            err,
            DatasetError::LengthMismatch {
                split: "valid",
                features: 1,
                labels: 2
            }
        ));
    }

    #[test]
    fn pickle_with_two_splits_is_a_layout_error() {
        let mut w = PickleWriter::new(2);
        w.op(b"(").op(b")").op(b")").op(b"t");
        let file = write_temp(&w.finish());
        assert!(matches!(load_data(file.path()), Err(DatasetError::Layout(_))));
    }

    #[test]
    fn unknown_file_is_rejected() {
        let file = write_temp(&gzip(b"not a dataset"));
        assert!(matches!(
            load_data(file.path()),
            Err(DatasetError::UnknownFormat { .. })
        ));
    }

    #[test]
    fn dtype_strings_and_byte_orders() {
        assert_eq!(
            Dtype::parse("f4", Some("<")).unwrap(),
            Dtype {
                kind: 'f',
                size: 4,
                endian: Endian::Little
            }
        );
        assert_eq!(Dtype::parse(">i8", None).unwrap().endian, Endian::Big);
        assert!(matches!(
            Dtype::parse("S", None),
            Err(DatasetError::UnsupportedDtype(_))
        ));

        let big = Dtype::parse("f8", Some(">")).unwrap();
        let values = big.decode(&0.5f64.to_be_bytes()).unwrap();
        assert_eq!(values, vec![0.5]);

        let bytes = Dtype::parse("u1", Some("|")).unwrap();
        assert_eq!(bytes.decode(&[0, 255]).unwrap(), vec![0.0, 255.0]);

        let complex = Dtype::parse("c8", Some("<")).unwrap();
        assert!(matches!(
            complex.decode(&[0; 8]),
            Err(DatasetError::UnsupportedDtype(_))
        ));
    }

    fn idx_images(rows: usize, side: usize, pixels: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&IDX_IMAGES_MAGIC.to_be_bytes());
        for size in [rows, side, side] {
            out.extend_from_slice(&(size as u32).to_be_bytes());
        }
        out.extend_from_slice(pixels);
        out
    }

    fn idx_labels(labels: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&IDX_LABELS_MAGIC.to_be_bytes());
        out.extend_from_slice(&(labels.len() as u32).to_be_bytes());
        out.extend_from_slice(labels);
        out
    }

    #[test]
    fn loads_idx_directory_with_validation_holdout() {
        let dir = tempfile::tempdir().unwrap();
        let train_pixels: Vec<u8> = (0..12 * 4).map(|i| i as u8).collect();
        let train_labels: Vec<u8> = (0..12).map(|i| i % 10).collect();
        fs::write(
            dir.path().join("train-images-idx3-ubyte.gz"),
            gzip(&idx_images(12, 2, &train_pixels)),
        )
        .unwrap();
        fs::write(
            dir.path().join("train-labels-idx1-ubyte"),
            idx_labels(&train_labels),
        )
        .unwrap();
        fs::write(
            dir.path().join("t10k-images-idx3-ubyte"),
            idx_images(1, 2, &[0, 255, 51, 102]),
        )
        .unwrap();
        fs::write(
            dir.path().join("t10k-labels-idx1-ubyte.gz"),
            gzip(&idx_labels(&[3])),
        )
        .unwrap();

        let data = load_data(dir.path()).unwrap();
        assert_eq!(data.train.len(), 10);
        assert_eq!(data.valid.len(), 2);
        assert_eq!(data.test.len(), 1);
        assert_eq!(data.train.n_features(), 4);
        assert_eq!(data.valid.label_indices().to_vec(), vec![0, 1]);
        assert_abs_diff_eq!(data.valid.features()[[0, 0]], 40.0 / 255.0);
        assert_abs_diff_eq!(data.test.features()[[0, 1]], 1.0);
        assert_abs_diff_eq!(data.test.features()[[0, 2]], 0.2);
    }

    #[test]
    fn splits_must_share_a_feature_width() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("train-images-idx3-ubyte"),
            idx_images(6, 2, &[0; 24]),
        )
        .unwrap();
        fs::write(
            dir.path().join("train-labels-idx1-ubyte"),
            idx_labels(&[0; 6]),
        )
        .unwrap();
        fs::write(
            dir.path().join("t10k-images-idx3-ubyte"),
            idx_images(1, 1, &[9]),
        )
        .unwrap();
        fs::write(dir.path().join("t10k-labels-idx1-ubyte"), idx_labels(&[3])).unwrap();

        match load_data(dir.path()) {
            Err(DatasetError::Layout(message)) => {
                assert!(message.starts_with("test split has 1 features"))
            }
            other => panic!("expected a layout error, got {other:?}"),
        }
    }

    #[test]
    fn idx_directory_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            load_data(dir.path()),
            Err(DatasetError::MissingIdxFile(_))
        ));
    }

    #[test]
    fn idx_header_sizes_must_not_overflow() {
        let mut bytes = IDX_IMAGES_MAGIC.to_be_bytes().to_vec();
        for _ in 0..3 {
            bytes.extend_from_slice(&u32::MAX.to_be_bytes());
        }
        match IdxRawData::new(&bytes) {
            Err(DatasetError::Idx(message)) => assert!(message.contains("overflow")),
            other => panic!("expected an IDX error, got {other:?}"),
        }
    }

    #[test]
    fn idx_header_must_match_payload() {
        let mut bytes = idx_labels(&[1, 2, 3]);
        bytes.pop();
        assert!(matches!(IdxRawData::new(&bytes), Err(DatasetError::Idx(_))));
    }
}
