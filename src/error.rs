use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PickleError {
    #[error("unexpected end of pickle stream")]
    UnexpectedEof,
    #[error("unsupported pickle opcode 0x{opcode:02x} at offset {offset}")]
    UnsupportedOpcode { opcode: u8, offset: u64 },
    #[error("unsupported pickle protocol {0}")]
    UnsupportedProtocol(u8),
    #[error("pickle stack underflow at offset {0}")]
    StackUnderflow(u64),
    #[error("pickle MARK expected but not found at offset {0}")]
    MissingMark(u64),
    #[error("pickle memo has no entry {0}")]
    MissingMemo(u32),
    #[error("pickle opcode at offset {offset} applied to the wrong kind of value: {expected} expected")]
    WrongTarget { offset: u64, expected: &'static str },
    #[error("pickle text is not valid utf-8")]
    InvalidUtf8,
    #[error("pickle integer does not fit in 64 bits")]
    IntegerOverflow,
    #[error("pickle stream ended without STOP")]
    MissingStop,
}

// the pickle reader only fails on a short buffer
impl From<std::io::Error> for PickleError {
    fn from(_: std::io::Error) -> Self {
        PickleError::UnexpectedEof
    }
}

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("failed to read dataset: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to decode pickle: {0}")]
    Pickle(#[from] PickleError),
    #[error("unrecognised dataset format (leading bytes {magic:02x?})")]
    UnknownFormat { magic: Vec<u8> },
    #[error("missing IDX file {0}")]
    MissingIdxFile(PathBuf),
    #[error("malformed IDX file: {0}")]
    Idx(String),
    #[error("unexpected dataset layout: {0}")]
    Layout(String),
    #[error("unsupported numpy dtype {0:?}")]
    UnsupportedDtype(String),
    #[error("{split} split has {features} feature rows but {labels} labels")]
    LengthMismatch {
        split: &'static str,
        features: usize,
        labels: usize,
    },
    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),
}

#[derive(Debug, Error)]
pub enum TrainError {
    #[error("{0} split yields no complete minibatch")]
    EmptySplit(&'static str),
    #[error("expected {layers} corruption levels, got {levels}")]
    CorruptionLevels { layers: usize, levels: usize },
    #[error("layer {layer} is out of range for a network with {n_layers} layers")]
    NoSuchLayer { layer: usize, n_layers: usize },
    #[error("label {label} is not a class index below {n_outs}")]
    LabelOutOfRange { label: i32, n_outs: usize },
    #[error("minibatch {index} is out of range ({n_batches} batches)")]
    NoSuchBatch { index: usize, n_batches: usize },
    #[error("{phase} cost diverged to {cost} on minibatch {index}")]
    Diverged {
        phase: &'static str,
        index: usize,
        cost: f64,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{levels} corruption levels given for {layers} hidden layers")]
    CorruptionLevelCount { layers: usize, levels: usize },
    #[error("corruption level {0} is outside [0, 1)")]
    CorruptionLevelRange(f32),
    #[error("at least one hidden layer is required")]
    NoHiddenLayers,
    #[error("{0} must be positive")]
    NotPositive(&'static str),
}
