use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::chart::ensure_same_length;
use crate::error::{DataError, Result};

/// One line of a cost file: `epoch,train,val`.
#[derive(Debug, Serialize, Deserialize)]
struct CostRow {
    /// Optional when reading; rows are taken in file order.
    #[serde(default)]
    epoch: Option<usize>,
    train: f64,
    val: f64,
}

/// Read training and validation costs from a CSV file.
pub fn read_costs(path: &Path) -> Result<(Vec<f64>, Vec<f64>)> {
    let file = std::fs::File::open(path)?;
    let costs = read_costs_from(file)?;
    log::debug!("Read {} epochs from {}", costs.0.len(), path.display());
    Ok(costs)
}

fn read_costs_from<R: Read>(reader: R) -> Result<(Vec<f64>, Vec<f64>)> {
    let mut reader = csv::Reader::from_reader(reader);
    let mut train = Vec::new();
    let mut val = Vec::new();

    for (row_no, result) in reader.deserialize::<CostRow>().enumerate() {
        let row = result?;
        if let Some(epoch) = row.epoch {
            if epoch != row_no {
                return Err(DataError::format(format!(
                    "cost row {row_no} is labelled epoch {epoch}"
                )));
            }
        }
        train.push(row.train);
        val.push(row.val);
    }

    Ok((train, val))
}

/// Write one row per epoch to `path`.
pub fn write_costs(path: &Path, costs_train: &[f64], costs_val: &[f64]) -> Result<()> {
    ensure_same_length(costs_train, costs_val)?;

    let mut writer = csv::Writer::from_path(path)?;
    for (epoch, (&train, &val)) in costs_train.iter().zip(costs_val).enumerate() {
        writer.serialize(CostRow {
            epoch: Some(epoch),
            train,
            val,
        })?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read() {
        let path = std::env::temp_dir().join(format!("mnist-prep-costs-{}.csv", std::process::id()));
        let train = [0.7, 0.5, 0.375];
        let val = [0.75, 0.625, 0.5];

        write_costs(&path, &train, &val).unwrap();
        let (read_train, read_val) = read_costs(&path).unwrap();
        assert_eq!(read_train, train);
        assert_eq!(read_val, val);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn epoch_column_is_optional() {
        let csv = "train,val\n1.5,2.5\n1.0,2.0\n";
        let (train, val) = read_costs_from(csv.as_bytes()).unwrap();
        assert_eq!(train, vec![1.5, 1.0]);
        assert_eq!(val, vec![2.5, 2.0]);
    }

    #[test]
    fn epochs_must_be_in_order() {
        let csv = "epoch,train,val\n0,1.0,1.0\n2,0.5,0.5\n";
        assert!(matches!(read_costs_from(csv.as_bytes()), Err(DataError::Format(_))));
    }

    #[test]
    fn non_numeric_cost_is_a_csv_error() {
        let csv = "epoch,train,val\n0,abc,1.0\n";
        assert!(matches!(read_costs_from(csv.as_bytes()), Err(DataError::Csv(_))));
    }

    #[test]
    fn refuses_to_write_mismatched_lengths() {
        let path = std::env::temp_dir().join("mnist-prep-never-written.csv");
        assert!(matches!(
            write_costs(&path, &[1.0, 2.0], &[1.0]),
            Err(DataError::LengthMismatch { train: 2, val: 1 })
        ));
    }
}
