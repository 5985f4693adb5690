use ndarray::{Array2, Axis};

/// Pixels per flattened 28×28 digit.
pub const IMAGE_FEATURES: usize = 784;

/// Digit classes 0 through 9.
pub const NUM_CLASSES: usize = 10;

/// Where the archive usually lives, relative to the working directory.
pub const DEFAULT_ARCHIVE_PATH: &str = "data/mnist.pkl.gz";

// ---------------------------------------------------------------------------
// RawSplit – one (images, labels) pair as stored in the archive
// ---------------------------------------------------------------------------

/// One pre-split part of the archive, samples-first as stored on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSplit {
    /// `samples × IMAGE_FEATURES`, one flattened image per row.
    pub images: Array2<f64>,
    /// Integer label of each row of `images`.
    pub labels: Vec<i64>,
}

impl RawSplit {
    /// Number of samples.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Whether the split holds no samples.
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

// ---------------------------------------------------------------------------
// MnistArchive – the complete decoded file
// ---------------------------------------------------------------------------

/// The three splits of the archive, in file order.
#[derive(Debug, Clone, PartialEq)]
pub struct MnistArchive {
    pub training: RawSplit,
    pub validation: RawSplit,
    /// Decoded for completeness; the task loaders do not return it.
    pub test: RawSplit,
}

impl MnistArchive {
    pub fn splits(&self) -> [(&'static str, &RawSplit); 3] {
        [
            ("training", &self.training),
            ("validation", &self.validation),
            ("test", &self.test),
        ]
    }
}

// ---------------------------------------------------------------------------
// TaskData – reshaped (X, Y) handed to a training routine
// ---------------------------------------------------------------------------

/// Features-first inputs and targets. Column `j` of `x` and of `y` describe
/// the same sample.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskData {
    /// `features × samples`.
    pub x: Array2<f64>,
    /// `1 × samples` labels or `classes × samples` one-hot targets.
    pub y: Array2<f64>,
}

impl TaskData {
    /// Number of samples (columns).
    pub fn samples(&self) -> usize {
        self.x.len_of(Axis(1))
    }

    /// Images transposed back to one row per sample.
    pub fn images_row_major(&self) -> Array2<f64> {
        self.x.t().to_owned()
    }
}
