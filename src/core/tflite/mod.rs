//! Read-only views over a TFLite FlatBuffer model and the FLOP analysis pass.

use std::path::Path;

use super::flops::{self, FeatureMapShape, FilterShape, OperatorKind, WeightShape};
use super::{Error, FlopRecord, Report, Shape};

pub(crate) mod reader;
pub(crate) mod schema;

use reader::{Table, Vector};
use schema::{builtin_options_type, vt};

const FILE_IDENTIFIER: &[u8; 4] = b"TFL3";

/// Root view over a TFLite model buffer.
pub(crate) struct Model<'a> {
    root: Table<'a>,
}

impl<'a> Model<'a> {
    pub(crate) fn read(buf: &'a [u8]) -> Result<Model<'a>, Error> {
        if buf.len() < 8 || &buf[4..8] != FILE_IDENTIFIER {
            return Err(Error::malformed(
                "not a TFLite FlatBuffer (missing TFL3 identifier)",
            ));
        }
        Ok(Model {
            root: Table::root(buf)?,
        })
    }

    pub(crate) fn subgraph(&self, index: usize) -> Result<Subgraph<'a>, Error> {
        match self.root.vector_field(vt::model::SUBGRAPHS)? {
            Some(subgraphs) => Subgraph::new(subgraphs.table_at(index, "subgraph")?),
            None => Err(Error::IndexOutOfRange {
                what: "subgraph",
                index: index as i64,
                count: 0,
            }),
        }
    }

    /// Effective builtin operator code for an entry of the operator-code
    /// table. Codes below 128 historically live in the deprecated i8 field,
    /// so the effective code is the larger of the two fields.
    pub(crate) fn builtin_code(&self, index: usize) -> Result<i32, Error> {
        let codes = self
            .root
            .vector_field(vt::model::OPERATOR_CODES)?
            .ok_or(Error::IndexOutOfRange {
                what: "operator code",
                index: index as i64,
                count: 0,
            })?;
        let entry = codes.table_at(index, "operator code")?;
        let deprecated = entry.i8_field(vt::operator_code::DEPRECATED_BUILTIN_CODE, 0)? as i32;
        let builtin = entry.i32_field(vt::operator_code::BUILTIN_CODE, 0)?;
        Ok(builtin.max(deprecated))
    }
}

/// View over one subgraph: its tensor table and its operators in stored
/// (execution) order.
pub(crate) struct Subgraph<'a> {
    tensors: Option<Vector<'a>>,
    operators: Option<Vector<'a>>,
}

impl<'a> Subgraph<'a> {
    fn new(table: Table<'a>) -> Result<Subgraph<'a>, Error> {
        Ok(Subgraph {
            tensors: table.vector_field(vt::sub_graph::TENSORS)?,
            operators: table.vector_field(vt::sub_graph::OPERATORS)?,
        })
    }

    pub(crate) fn operator_count(&self) -> usize {
        self.operators.map_or(0, |v| v.len())
    }

    pub(crate) fn operator(&self, index: usize) -> Result<Operator<'a>, Error> {
        match &self.operators {
            Some(operators) => Operator::new(operators.table_at(index, "operator")?),
            None => Err(Error::IndexOutOfRange {
                what: "operator",
                index: index as i64,
                count: 0,
            }),
        }
    }

    /// Declared shape of the tensor at `tensor_index`, in dimension order.
    pub(crate) fn tensor_shape(&self, tensor_index: i32) -> Result<Shape, Error> {
        let count = self.tensors.map_or(0, |v| v.len());
        let index = usize::try_from(tensor_index).map_err(|_| Error::IndexOutOfRange {
            what: "tensor",
            index: tensor_index as i64,
            count,
        })?;
        let tensors = match &self.tensors {
            Some(tensors) => tensors,
            None => {
                return Err(Error::IndexOutOfRange {
                    what: "tensor",
                    index: tensor_index as i64,
                    count: 0,
                })
            }
        };

        let tensor = tensors.table_at(index, "tensor")?;
        let dims = match tensor.vector_field(vt::tensor::SHAPE)? {
            Some(dims) => dims,
            None => return Ok(Shape::new()),
        };

        let mut shape = Shape::with_capacity(dims.len());
        for i in 0..dims.len() {
            let d = dims.i32_at(i, "shape dimension")?;
            if d < 0 {
                return Err(Error::malformed(format!(
                    "tensor {} declares negative dimension {}",
                    index, d
                )));
            }
            shape.push(d as u64);
        }
        Ok(shape)
    }
}

/// Kernel extents recovered from a pooling operator's options.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PoolOptions {
    pub filter_h: u64,
    pub filter_w: u64,
}

pub(crate) struct Operator<'a> {
    table: Table<'a>,
    inputs: Option<Vector<'a>>,
    outputs: Option<Vector<'a>>,
}

impl<'a> Operator<'a> {
    fn new(table: Table<'a>) -> Result<Operator<'a>, Error> {
        Ok(Operator {
            table,
            inputs: table.vector_field(vt::operator::INPUTS)?,
            outputs: table.vector_field(vt::operator::OUTPUTS)?,
        })
    }

    pub(crate) fn opcode_index(&self) -> Result<usize, Error> {
        Ok(self.table.u32_field(vt::operator::OPCODE_INDEX, 0)? as usize)
    }

    pub(crate) fn input(&self, index: usize) -> Result<i32, Error> {
        match &self.inputs {
            Some(inputs) => inputs.i32_at(index, "operator input"),
            None => Err(Error::IndexOutOfRange {
                what: "operator input",
                index: index as i64,
                count: 0,
            }),
        }
    }

    pub(crate) fn output(&self, index: usize) -> Result<i32, Error> {
        match &self.outputs {
            Some(outputs) => outputs.i32_at(index, "operator output"),
            None => Err(Error::IndexOutOfRange {
                what: "operator output",
                index: index as i64,
                count: 0,
            }),
        }
    }

    /// Decode the `Pool2DOptions` union member of this operator's options.
    pub(crate) fn pool_options(&self) -> Result<PoolOptions, Error> {
        let options_type = self.table.u8_field(vt::operator::BUILTIN_OPTIONS_TYPE, 0)?;
        if options_type != builtin_options_type::POOL_2D_OPTIONS {
            return Err(Error::malformed(format!(
                "pooling operator carries options type {} instead of Pool2DOptions",
                options_type
            )));
        }
        let options = self
            .table
            .table_field(vt::operator::BUILTIN_OPTIONS)?
            .ok_or_else(|| Error::malformed("pooling operator is missing its options table"))?;

        let filter_w = options.i32_field(vt::pool_2d_options::FILTER_WIDTH, 0)?;
        let filter_h = options.i32_field(vt::pool_2d_options::FILTER_HEIGHT, 0)?;
        if filter_w < 0 || filter_h < 0 {
            return Err(Error::malformed(format!(
                "pooling operator declares negative kernel {}x{}",
                filter_h, filter_w
            )));
        }
        Ok(PoolOptions {
            filter_h: filter_h as u64,
            filter_w: filter_w as u64,
        })
    }
}

/// Map the model file into memory and analyze it.
pub(crate) fn analyze(file_path: &Path) -> Result<Report, Error> {
    let file = std::fs::File::open(file_path).map_err(|source| Error::FileAccess {
        path: file_path.to_path_buf(),
        source,
    })?;
    let len = file
        .metadata()
        .map_err(|source| Error::FileAccess {
            path: file_path.to_path_buf(),
            source,
        })?
        .len();
    if len == 0 {
        return Err(Error::malformed("file is empty"));
    }

    let buffer = unsafe { memmap2::MmapOptions::new().map(&file) }.map_err(|source| {
        Error::FileAccess {
            path: file_path.to_path_buf(),
            source,
        }
    })?;

    analyze_buffer(&buffer)
}

/// Walk the first subgraph's operators in stored order, classify each one
/// and accumulate FLOP counts. Records are collected into a completed
/// report before anything is rendered; a failure mid-pass yields no rows.
pub(crate) fn analyze_buffer(buf: &[u8]) -> Result<Report, Error> {
    let model = Model::read(buf)?;
    let graph = model.subgraph(0)?;

    let mut records = Vec::with_capacity(graph.operator_count());
    let mut total_flops = 0u64;

    for i in 0..graph.operator_count() {
        let op = graph.operator(i)?;
        let code = model.builtin_code(op.opcode_index()?)?;
        let op_name = schema::builtin_op_name(code);

        let record = match OperatorKind::from_builtin_code(code) {
            OperatorKind::Conv2D => {
                let filter = FilterShape::from_shape(&graph.tensor_shape(op.input(1)?)?)?;
                let output_shape = graph.tensor_shape(op.output(0)?)?;
                let out = FeatureMapShape::from_shape(&output_shape)?;
                FlopRecord {
                    op_name,
                    output_shape,
                    flops: Some(flops::conv_2d(&filter, &out)),
                }
            }
            OperatorKind::DepthwiseConv2D => {
                let filter = FilterShape::from_shape(&graph.tensor_shape(op.input(1)?)?)?;
                let output_shape = graph.tensor_shape(op.output(0)?)?;
                let out = FeatureMapShape::from_shape(&output_shape)?;
                FlopRecord {
                    op_name,
                    output_shape,
                    flops: Some(flops::depthwise_conv_2d(&filter, &out)),
                }
            }
            kind @ (OperatorKind::MaxPool2D | OperatorKind::AveragePool2D) => {
                let output_shape = graph.tensor_shape(op.output(0)?)?;
                let out = FeatureMapShape::from_shape(&output_shape)?;
                let options = op.pool_options()?;
                let count = if kind == OperatorKind::MaxPool2D {
                    flops::max_pool_2d(options.filter_h, options.filter_w, &out)
                } else {
                    flops::average_pool_2d(options.filter_h, options.filter_w, &out)
                };
                FlopRecord {
                    op_name,
                    output_shape,
                    flops: Some(count),
                }
            }
            OperatorKind::FullyConnected => {
                let batch = flops::batch_size(&graph.tensor_shape(op.input(0)?)?)?;
                let weight = WeightShape::from_shape(&graph.tensor_shape(op.input(1)?)?)?;
                // FULLY_CONNECTED reports the shape of its second output.
                let output_shape = graph.tensor_shape(op.output(1)?)?;
                FlopRecord {
                    op_name,
                    output_shape,
                    flops: Some(flops::fully_connected(batch, &weight)),
                }
            }
            OperatorKind::Unsupported => FlopRecord {
                op_name,
                output_shape: graph.tensor_shape(op.output(0)?)?,
                flops: None,
            },
        };

        total_flops += record.flops.unwrap_or(0);
        records.push(record);
    }

    Ok(Report {
        records,
        total_flops,
    })
}

#[cfg(test)]
mod tests {
    use flatbuffers::FlatBufferBuilder;

    use super::schema::{builtin_op, builtin_options_type, vt};
    use super::*;

    struct OpSpec {
        opcode_index: u32,
        inputs: Vec<i32>,
        outputs: Vec<i32>,
        /// Kernel (height, width) to encode as Pool2DOptions.
        pool_filter: Option<(i32, i32)>,
    }

    fn op(opcode_index: u32, inputs: &[i32], outputs: &[i32]) -> OpSpec {
        OpSpec {
            opcode_index,
            inputs: inputs.to_vec(),
            outputs: outputs.to_vec(),
            pool_filter: None,
        }
    }

    fn pool_op(opcode_index: u32, inputs: &[i32], outputs: &[i32], kernel: (i32, i32)) -> OpSpec {
        OpSpec {
            pool_filter: Some(kernel),
            ..op(opcode_index, inputs, outputs)
        }
    }

    fn opcode(code: i32) -> (i8, i32) {
        (if code <= 127 { code as i8 } else { 127 }, code)
    }

    /// Build a real TFLite FlatBuffer with one subgraph via manual table
    /// construction.
    fn build_model(
        operator_codes: &[(i8, i32)],
        tensor_shapes: &[Vec<i32>],
        ops: &[OpSpec],
    ) -> Vec<u8> {
        let mut fbb = FlatBufferBuilder::with_capacity(1024);

        let mut tensor_offsets = Vec::new();
        for shape in tensor_shapes {
            let shape_vec = fbb.create_vector(shape.as_slice());
            let start = fbb.start_table();
            fbb.push_slot_always(vt::tensor::SHAPE, shape_vec);
            tensor_offsets.push(fbb.end_table(start));
        }
        let tensors = fbb.create_vector(&tensor_offsets);

        let mut opcode_offsets = Vec::new();
        for &(deprecated, builtin) in operator_codes {
            let start = fbb.start_table();
            fbb.push_slot::<i8>(vt::operator_code::DEPRECATED_BUILTIN_CODE, deprecated, 0);
            fbb.push_slot::<i32>(vt::operator_code::BUILTIN_CODE, builtin, 0);
            opcode_offsets.push(fbb.end_table(start));
        }
        let operator_codes = fbb.create_vector(&opcode_offsets);

        let mut op_offsets = Vec::new();
        for op_spec in ops {
            let pool_options = op_spec.pool_filter.map(|(h, w)| {
                let start = fbb.start_table();
                fbb.push_slot::<i32>(vt::pool_2d_options::FILTER_WIDTH, w, 0);
                fbb.push_slot::<i32>(vt::pool_2d_options::FILTER_HEIGHT, h, 0);
                fbb.end_table(start)
            });
            let inputs = fbb.create_vector(op_spec.inputs.as_slice());
            let outputs = fbb.create_vector(op_spec.outputs.as_slice());
            let start = fbb.start_table();
            fbb.push_slot::<u32>(vt::operator::OPCODE_INDEX, op_spec.opcode_index, 0);
            fbb.push_slot_always(vt::operator::INPUTS, inputs);
            fbb.push_slot_always(vt::operator::OUTPUTS, outputs);
            if let Some(options) = pool_options {
                fbb.push_slot::<u8>(
                    vt::operator::BUILTIN_OPTIONS_TYPE,
                    builtin_options_type::POOL_2D_OPTIONS,
                    0,
                );
                fbb.push_slot_always(vt::operator::BUILTIN_OPTIONS, options);
            }
            op_offsets.push(fbb.end_table(start));
        }
        let operators = fbb.create_vector(&op_offsets);

        let subgraph = {
            let start = fbb.start_table();
            fbb.push_slot_always(vt::sub_graph::TENSORS, tensors);
            fbb.push_slot_always(vt::sub_graph::OPERATORS, operators);
            fbb.end_table(start)
        };
        let subgraphs = fbb.create_vector(&[subgraph]);

        let model = {
            let start = fbb.start_table();
            fbb.push_slot_always(vt::model::OPERATOR_CODES, operator_codes);
            fbb.push_slot_always(vt::model::SUBGRAPHS, subgraphs);
            fbb.end_table(start)
        };

        fbb.finish(model, Some("TFL3"));
        fbb.finished_data().to_vec()
    }

    const SOFTMAX: i32 = 25;

    fn mobilenet_style_model() -> Vec<u8> {
        build_model(
            &[
                opcode(builtin_op::CONV_2D),
                opcode(builtin_op::DEPTHWISE_CONV_2D),
                opcode(builtin_op::MAX_POOL_2D),
                opcode(builtin_op::AVERAGE_POOL_2D),
                opcode(builtin_op::FULLY_CONNECTED),
                opcode(SOFTMAX),
            ],
            &[
                vec![1, 16, 16, 3],  // 0: conv input
                vec![8, 3, 3, 3],    // 1: conv filter
                vec![1, 16, 16, 8],  // 2: conv output
                vec![1, 3, 3, 16],   // 3: depthwise filter
                vec![1, 8, 8, 16],   // 4: depthwise output
                vec![1, 7, 7, 32],   // 5: pool output
                vec![1, 128],        // 6: fc input
                vec![10, 128],       // 7: fc weight
                vec![1, 10],         // 8: fc output
                vec![1, 10],         // 9: softmax output
            ],
            &[
                op(0, &[0, 1], &[2]),
                op(1, &[2, 3], &[4]),
                pool_op(2, &[4], &[5], (2, 2)),
                pool_op(3, &[5], &[5], (2, 2)),
                op(4, &[6, 7], &[8, 8]),
                op(5, &[8], &[9]),
            ],
        )
    }

    #[test]
    fn analyze_counts_every_supported_operator() {
        let report = analyze_buffer(&mobilenet_style_model()).unwrap();

        let counts: Vec<Option<u64>> = report.records.iter().map(|r| r.flops).collect();
        assert_eq!(
            counts,
            vec![
                Some(221184),
                Some(18432),
                Some(4704),
                Some(6272),
                Some(2560),
                None,
            ]
        );
        assert_eq!(report.total_flops, 221184 + 18432 + 4704 + 6272 + 2560);

        let names: Vec<&str> = report.records.iter().map(|r| r.op_name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "CONV_2D",
                "DEPTHWISE_CONV_2D",
                "MAX_POOL_2D",
                "AVERAGE_POOL_2D",
                "FULLY_CONNECTED",
                "SOFTMAX",
            ]
        );
        assert_eq!(report.records[0].output_shape, vec![1, 16, 16, 8]);
        assert_eq!(report.records[4].output_shape, vec![1, 10]);
    }

    #[test]
    fn unsupported_operator_is_ignored_not_fatal() {
        let model = build_model(
            &[opcode(SOFTMAX)],
            &[vec![1, 10]],
            &[op(0, &[0], &[0])],
        );
        let report = analyze_buffer(&model).unwrap();
        assert_eq!(report.records.len(), 1);
        assert_eq!(report.records[0].flops, None);
        assert_eq!(report.total_flops, 0);
        assert!(report.to_string().contains("<IGNORED>"));
    }

    #[test]
    fn empty_subgraph_yields_empty_report() {
        let model = build_model(&[], &[], &[]);
        let report = analyze_buffer(&model).unwrap();
        assert!(report.records.is_empty());
        assert_eq!(report.total_flops, 0);
    }

    #[test]
    fn out_of_range_tensor_reference_fails() {
        let model = build_model(
            &[opcode(builtin_op::CONV_2D)],
            &[vec![1, 16, 16, 3], vec![8, 3, 3, 3]],
            &[op(0, &[0, 99], &[1])],
        );
        let err = analyze_buffer(&model).unwrap_err();
        assert!(matches!(
            err,
            Error::IndexOutOfRange {
                what: "tensor",
                index: 99,
                count: 2,
            }
        ));
    }

    #[test]
    fn negative_tensor_reference_fails() {
        let model = build_model(
            &[opcode(SOFTMAX)],
            &[vec![1, 10]],
            &[op(0, &[0], &[-1])],
        );
        let err = analyze_buffer(&model).unwrap_err();
        assert!(matches!(
            err,
            Error::IndexOutOfRange {
                what: "tensor",
                index: -1,
                ..
            }
        ));
    }

    #[test]
    fn pooling_without_options_is_malformed() {
        let model = build_model(
            &[opcode(builtin_op::MAX_POOL_2D)],
            &[vec![1, 7, 7, 32]],
            &[op(0, &[0], &[0])],
        );
        let err = analyze_buffer(&model).unwrap_err();
        assert!(matches!(err, Error::MalformedModel(_)));
    }

    #[test]
    fn fully_connected_requires_a_second_output() {
        let model = build_model(
            &[opcode(builtin_op::FULLY_CONNECTED)],
            &[vec![1, 128], vec![10, 128], vec![1, 10]],
            &[op(0, &[0, 1], &[2])],
        );
        let err = analyze_buffer(&model).unwrap_err();
        assert!(matches!(
            err,
            Error::IndexOutOfRange {
                what: "operator output",
                index: 1,
                count: 1,
            }
        ));
    }

    #[test]
    fn negative_dimension_is_malformed() {
        let model = build_model(
            &[opcode(SOFTMAX)],
            &[vec![-1, 10]],
            &[op(0, &[0], &[0])],
        );
        let err = analyze_buffer(&model).unwrap_err();
        assert!(matches!(err, Error::MalformedModel(_)));
    }

    #[test]
    fn deprecated_builtin_code_field_still_resolves() {
        // Older writers leave builtin_code at 0 and use the i8 field only.
        let model = build_model(
            &[(builtin_op::MAX_POOL_2D as i8, 0)],
            &[vec![1, 7, 7, 32]],
            &[pool_op(0, &[0], &[0], (2, 2))],
        );
        let report = analyze_buffer(&model).unwrap();
        assert_eq!(report.records[0].op_name, "MAX_POOL_2D");
        assert_eq!(report.records[0].flops, Some(4704));
    }

    #[test]
    fn out_of_range_opcode_index_fails() {
        let model = build_model(
            &[opcode(SOFTMAX)],
            &[vec![1, 10]],
            &[op(7, &[0], &[0])],
        );
        let err = analyze_buffer(&model).unwrap_err();
        assert!(matches!(
            err,
            Error::IndexOutOfRange {
                what: "operator code",
                index: 7,
                count: 1,
            }
        ));
    }

    #[test]
    fn garbage_buffer_is_malformed() {
        assert!(matches!(
            analyze_buffer(b"definitely not a model"),
            Err(Error::MalformedModel(_))
        ));
        assert!(matches!(
            analyze_buffer(&[0u8; 4]),
            Err(Error::MalformedModel(_))
        ));
    }

    #[test]
    fn truncated_valid_model_is_malformed() {
        let model = mobilenet_style_model();
        let truncated = &model[..model.len() / 2];
        assert!(analyze_buffer(truncated).is_err());
    }

    #[test]
    fn analyze_reads_model_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.tflite");
        std::fs::write(&path, mobilenet_style_model()).unwrap();

        let report = analyze(&path).unwrap();
        assert_eq!(report.records.len(), 6);
        assert_eq!(report.total_flops, 253152);
    }

    #[test]
    fn missing_file_is_a_file_access_error() {
        let err = analyze(Path::new("/nonexistent/model.tflite")).unwrap_err();
        assert!(matches!(err, Error::FileAccess { .. }));
    }
}
