use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use ndarray::Array2;

use super::encode::multiclass_task;
use super::filter::binary_task;
use super::model::{MnistArchive, RawSplit, TaskData, IMAGE_FEATURES};
use super::pickle;
use crate::error::{DataError, Result};

/// One split as stored in the JSON conversion format: `[images, labels]`.
type JsonSplit = (Vec<Vec<f64>>, Vec<i64>);

/// `[training, validation, test]`.
type JsonArchive = (JsonSplit, JsonSplit, JsonSplit);

// ---------------------------------------------------------------------------
// Public entry-points
// ---------------------------------------------------------------------------

/// Load the three splits of an archive.  Dispatch by file name.
///
/// Supported formats:
/// * `.pkl.gz`  – gzip-compressed pickle of
///   `((train_x, train_y), (val_x, val_y), (test_x, test_y))` NumPy arrays
/// * `.json.gz` – gzip-compressed JSON `[[images, labels], ...]`, the format
///   written by [`save_json_gz`]
pub fn load_archive(path: &Path) -> Result<MnistArchive> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let archive = if name.ends_with(".pkl.gz") {
        load_pickle_gz(path)?
    } else if name.ends_with(".json.gz") {
        load_json_gz(path)?
    } else {
        return Err(DataError::UnsupportedArchive(path.to_path_buf()));
    };

    for (split, data) in archive.splits() {
        log::debug!("{split}: {} samples", data.len());
    }
    log::info!(
        "Loaded {} ({} train / {} val / {} test)",
        path.display(),
        archive.training.len(),
        archive.validation.len(),
        archive.test.len()
    );
    Ok(archive)
}

/// Training and validation data for telling 0s from 1s.
pub fn load_binary(path: &Path) -> Result<(TaskData, TaskData)> {
    let archive = load_archive(path)?;
    Ok((
        binary_task(&archive.training),
        binary_task(&archive.validation),
    ))
}

/// Training and validation data for all ten digits, one-hot encoded.
pub fn load_multiclass(path: &Path) -> Result<(TaskData, TaskData)> {
    let archive = load_archive(path)?;
    Ok((
        multiclass_task(&archive.training)?,
        multiclass_task(&archive.validation)?,
    ))
}

/// Write `archive` in the JSON conversion format read by [`load_archive`].
pub fn save_json_gz(archive: &MnistArchive, path: &Path) -> Result<()> {
    let json: JsonArchive = (
        json_split(&archive.training),
        json_split(&archive.validation),
        json_split(&archive.test),
    );

    let file = File::create(path)?;
    let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    serde_json::to_writer(&mut encoder, &json)?;
    encoder.finish()?.flush()?;

    log::info!("Wrote {}", path.display());
    Ok(())
}

/// Open `path` for decompressed reading. The file is closed when the
/// returned reader is dropped.
fn open_gz(path: &Path) -> Result<BufReader<MultiGzDecoder<BufReader<File>>>> {
    let file = File::open(path)?;
    Ok(BufReader::new(MultiGzDecoder::new(BufReader::new(file))))
}

// ---------------------------------------------------------------------------
// Pickle loader
// ---------------------------------------------------------------------------

fn load_pickle_gz(path: &Path) -> Result<MnistArchive> {
    let value = pickle::from_reader(open_gz(path)?)?;

    let splits = value.into_items()?;
    let [training, validation, test]: [pickle::Value; 3] = splits
        .try_into()
        .map_err(|v: Vec<_>| DataError::format(format!("expected 3 splits, found {}", v.len())))?;

    Ok(MnistArchive {
        training: pickle_split("training", training)?,
        validation: pickle_split("validation", validation)?,
        test: pickle_split("test", test)?,
    })
}

fn pickle_split(name: &str, value: pickle::Value) -> Result<RawSplit> {
    let pair = value.into_items()?;
    let [images, labels]: [pickle::Value; 2] = pair.try_into().map_err(|v: Vec<_>| {
        DataError::format(format!("{name}: expected (images, labels), found {} items", v.len()))
    })?;

    let images = images.into_array()?.into_matrix()?;
    let labels = labels.into_array()?.into_labels()?;
    checked_split(name, images, labels)
}

// ---------------------------------------------------------------------------
// JSON loader
// ---------------------------------------------------------------------------

fn load_json_gz(path: &Path) -> Result<MnistArchive> {
    let reader = open_gz(path)?;
    let (training, validation, test): JsonArchive =
        serde_json::from_reader(reader).map_err(|e| {
            if e.is_io() {
                DataError::format(format!("decompressing: {e}"))
            } else {
                DataError::Json(e)
            }
        })?;

    Ok(MnistArchive {
        training: json_to_split("training", training)?,
        validation: json_to_split("validation", validation)?,
        test: json_to_split("test", test)?,
    })
}

fn json_to_split(name: &str, (rows, labels): JsonSplit) -> Result<RawSplit> {
    let n_rows = rows.len();
    let mut flat = Vec::with_capacity(n_rows * IMAGE_FEATURES);
    for (i, row) in rows.into_iter().enumerate() {
        if row.len() != IMAGE_FEATURES {
            return Err(DataError::format(format!(
                "{name}: image {i} has {} values, expected {IMAGE_FEATURES}",
                row.len()
            )));
        }
        flat.extend(row);
    }
    let images = Array2::from_shape_vec((n_rows, IMAGE_FEATURES), flat)
        .map_err(|e| DataError::format(format!("{name}: {e}")))?;
    checked_split(name, images, labels)
}

fn json_split(split: &RawSplit) -> JsonSplit {
    (
        split.images.outer_iter().map(|row| row.to_vec()).collect(),
        split.labels.clone(),
    )
}

// -- Shared checks --

fn checked_split(name: &str, images: Array2<f64>, labels: Vec<i64>) -> Result<RawSplit> {
    if images.ncols() != IMAGE_FEATURES {
        return Err(DataError::format(format!(
            "{name}: images have {} features, expected {IMAGE_FEATURES}",
            images.ncols()
        )));
    }
    if images.nrows() != labels.len() {
        return Err(DataError::format(format!(
            "{name}: {} images but {} labels",
            images.nrows(),
            labels.len()
        )));
    }
    Ok(RawSplit { images, labels })
}
