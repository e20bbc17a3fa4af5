use std::io::Write;

use crate::serialize::Record;

/// Writes one JSON object per record, one per line.
pub fn dump_record<W: Write>(records: &[Record], mut output: W) -> serde_json::Result<()> {
    for record in records {
        serde_json::to_writer(&mut output, record)?;
        writeln!(output).map_err(serde_json::Error::io)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::records::{CalibrationErr, ZeroTime};

    #[test]
    fn test_json_lines() {
        let records = vec![
            Record::ZeroTime(ZeroTime { zero_time: 5 }),
            Record::CalibrationErr(CalibrationErr { calibration_err: -2 }),
        ];
        let mut output = Vec::new();
        dump_record(&records, &mut output).unwrap();
        assert_eq!(
            String::from_utf8(output).unwrap(),
            "{\"ZeroTime\":{\"zero_time\":5}}\n{\"CalibrationErr\":{\"calibration_err\":-2}}\n"
        );
    }
}
