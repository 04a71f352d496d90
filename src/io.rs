/*!
# CSV Export of Posterior Samples

Writes posterior draws and weighted point tables to CSV files. Enable via
the `csv` feature.
*/

use std::error::Error;
use std::fs::File;

use csv::Writer;

use crate::points::PointStore;

/**
Saves equal-weight posterior draws as a CSV file.

The resulting file has a header row with `"sample"` and one column per
dimension named `"dim_0"`, `"dim_1"`, etc., followed by one row per draw.

# Example

```rust
use mini_nest::io::save_samples_csv;

let samples = vec![vec![1.0, 2.0], vec![3.0, 4.0]];
save_samples_csv(&samples, "/tmp/posterior.csv")?;
# Ok::<(), Box<dyn std::error::Error>>(())
```
*/
pub fn save_samples_csv(samples: &[Vec<f64>], filename: &str) -> Result<(), Box<dyn Error>> {
    let mut wtr = Writer::from_writer(File::create(filename)?);
    let n_dims = samples.first().map_or(0, Vec::len);

    let mut header: Vec<String> = vec!["sample".to_string()];
    header.extend((0..n_dims).map(|i| format!("dim_{}", i)));
    wtr.write_record(&header)?;

    for (idx, sample) in samples.iter().enumerate() {
        let mut row = vec![idx.to_string()];
        row.extend(sample.iter().map(|v| v.to_string()));
        wtr.write_record(&row)?;
    }

    wtr.flush()?;
    Ok(())
}

/**
Saves every weighted point of a finished run as a CSV file.

Each row holds the shell id, log-likelihood, log-weight and the parameter
vector of one retained point. Points excluded from the posterior weighting
are skipped.
*/
pub fn save_points_csv(store: &PointStore, filename: &str) -> Result<(), Box<dyn Error>> {
    let mut wtr = Writer::from_writer(File::create(filename)?);
    let n_dims = store.iter().next().map_or(0, |p| p.params.len());

    let mut header: Vec<String> = vec![
        "shell".to_string(),
        "log_l".to_string(),
        "log_weight".to_string(),
    ];
    header.extend((0..n_dims).map(|i| format!("dim_{}", i)));
    wtr.write_record(&header)?;

    for point in store.retained() {
        let mut row = vec![
            point.shell.to_string(),
            point.log_l.to_string(),
            point.log_weight.to_string(),
        ];
        row.extend(point.params.iter().map(|v| v.to_string()));
        wtr.write_record(&row)?;
    }

    wtr.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use csv::Reader;
    use std::fs;
    use tempfile::NamedTempFile;

    #[test]
    fn test_save_samples_csv() {
        let samples = vec![vec![1.0, 2.0], vec![3.5, 4.5]];
        let file = NamedTempFile::new().expect("Could not create temp file");
        let filename = file.path().to_str().unwrap();

        save_samples_csv(&samples, filename).unwrap();

        let contents = fs::read_to_string(filename).unwrap();
        let expected = "sample,dim_0,dim_1\n0,1,2\n1,3.5,4.5";
        assert_eq!(contents.trim(), expected);
    }

    #[test]
    fn test_save_samples_csv_empty() {
        let samples: Vec<Vec<f64>> = Vec::new();
        let file = NamedTempFile::new().expect("Could not create temp file");
        let filename = file.path().to_str().unwrap();

        save_samples_csv(&samples, filename).unwrap();

        let contents = fs::read_to_string(filename).unwrap();
        assert_eq!(contents.trim(), "sample");
    }

    #[test]
    fn test_save_points_csv_skips_discarded() {
        let mut store = PointStore::new();
        store.push(vec![0.1, 0.1], vec![1.0, 1.0], -1.0, 0, false, true);
        store.push(vec![0.9, 0.9], vec![9.0, 9.0], -2.0, 0, false, false);
        let mut shells = vec![crate::shell::Shell::root(2)];
        store.recompute_weights(&mut shells, true);

        let file = NamedTempFile::new().expect("Could not create temp file");
        let filename = file.path().to_str().unwrap();
        save_points_csv(&store, filename).unwrap();

        let contents = fs::read_to_string(filename).unwrap();
        let mut rdr = Reader::from_reader(contents.as_bytes());
        let headers = rdr.headers().unwrap();
        assert_eq!(&headers[0], "shell");
        assert_eq!(&headers[3], "dim_0");
        let records: Vec<_> = rdr.records().collect::<Result<_, _>>().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(&records[0][1], "-2");
    }
}
