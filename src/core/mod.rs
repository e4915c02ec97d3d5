use std::{fmt, path::PathBuf};

pub(crate) mod flops;
pub(crate) mod tflite;

pub(crate) type Shape = Vec<u64>;

#[derive(Debug, thiserror::Error)]
pub(crate) enum Error {
    /// The model file cannot be opened or read.
    #[error("cannot access {}: {source}", path.display())]
    FileAccess {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The buffer does not conform to the TFLite FlatBuffer schema.
    #[error("malformed model: {0}")]
    MalformedModel(String),

    /// A subgraph, tensor, operator-code or shape-dimension index is out of bounds.
    /// Tensor references are signed in the schema, so a negative index lands
    /// here as well.
    #[error("{what} index {index} out of range (count: {count})")]
    IndexOutOfRange {
        what: &'static str,
        index: i64,
        count: usize,
    },
}

impl Error {
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        Error::MalformedModel(msg.into())
    }
}

/// Per-operator cost entry. A `flops` of `None` means the operator kind is
/// not covered by the cost model and is rendered as `<IGNORED>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FlopRecord {
    pub op_name: String,
    pub output_shape: Shape,
    pub flops: Option<u64>,
}

/// Completed analysis of a model's first subgraph, one record per operator
/// in execution order. Rendering happens only from a fully built report, so
/// a failed analysis never prints partial rows.
#[derive(Debug, Clone, Default)]
pub(crate) struct Report {
    pub records: Vec<FlopRecord>,
    pub total_flops: u64,
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:<18} | {:<15} | FLOPS", "OP_NAME", "OUTPUT SHAPE")?;
        writeln!(f, "{}", "-".repeat(45))?;

        for record in &self.records {
            let shape = format!("{:?}", record.output_shape);
            match record.flops {
                Some(flops) => {
                    writeln!(f, "{:<18} | {:<15} | {}", record.op_name, shape, flops)?
                }
                None => writeln!(f, "{:<18} | {:<15} | <IGNORED>", record.op_name, shape)?,
            }
        }

        writeln!(f, "{}", "-".repeat(45))?;
        writeln!(f, "Total: {:.1} M FLOPS", self.total_flops as f64 / 1.0e6)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_renders_rows_and_total() {
        let report = Report {
            records: vec![
                FlopRecord {
                    op_name: "CONV_2D".to_string(),
                    output_shape: vec![1, 16, 16, 8],
                    flops: Some(221184),
                },
                FlopRecord {
                    op_name: "SOFTMAX".to_string(),
                    output_shape: vec![1, 10],
                    flops: None,
                },
            ],
            total_flops: 221184,
        };

        let rendered = report.to_string();
        let lines: Vec<&str> = rendered.lines().collect();

        assert_eq!(lines[0], "OP_NAME            | OUTPUT SHAPE    | FLOPS");
        assert_eq!(lines[1], "-".repeat(45));
        assert_eq!(lines[2], "CONV_2D            | [1, 16, 16, 8]  | 221184");
        assert_eq!(lines[3], "SOFTMAX            | [1, 10]         | <IGNORED>");
        assert_eq!(lines[4], "-".repeat(45));
        assert_eq!(lines[5], "Total: 0.2 M FLOPS");
    }

    #[test]
    fn empty_report_renders_zero_total() {
        let report = Report::default();
        let rendered = report.to_string();
        assert!(rendered.ends_with("Total: 0.0 M FLOPS\n"));
        assert_eq!(rendered.lines().count(), 4);
    }
}
