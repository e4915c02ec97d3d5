//! Per-operator FLOP formulas.
//!
//! A FLOP is one floating-point multiply or add, counted individually
//! (a multiply-accumulate counts as two). Counts depend only on declared
//! shapes and options, never on tensor contents.

use super::tflite::schema::builtin_op;
use super::{Error, Shape};

/// Operator kinds covered by the cost model. Everything else classifies as
/// `Unsupported`, which is a valid result rather than an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OperatorKind {
    Conv2D,
    DepthwiseConv2D,
    MaxPool2D,
    AveragePool2D,
    FullyConnected,
    Unsupported,
}

impl OperatorKind {
    pub(crate) fn from_builtin_code(code: i32) -> Self {
        match code {
            builtin_op::CONV_2D => OperatorKind::Conv2D,
            builtin_op::DEPTHWISE_CONV_2D => OperatorKind::DepthwiseConv2D,
            builtin_op::MAX_POOL_2D => OperatorKind::MaxPool2D,
            builtin_op::AVERAGE_POOL_2D => OperatorKind::AveragePool2D,
            builtin_op::FULLY_CONNECTED => OperatorKind::FullyConnected,
            _ => OperatorKind::Unsupported,
        }
    }
}

fn dim(shape: &Shape, index: usize) -> Result<u64, Error> {
    shape.get(index).copied().ok_or(Error::IndexOutOfRange {
        what: "shape dimension",
        index: index as i64,
        count: shape.len(),
    })
}

/// Convolution filter laid out as (out-channels, kernel-h, kernel-w, in-channels).
#[derive(Debug, Clone, Copy)]
pub(crate) struct FilterShape {
    pub c_out: u64,
    pub k_h: u64,
    pub k_w: u64,
    pub c_in: u64,
}

impl FilterShape {
    pub(crate) fn from_shape(shape: &Shape) -> Result<Self, Error> {
        Ok(FilterShape {
            c_out: dim(shape, 0)?,
            k_h: dim(shape, 1)?,
            k_w: dim(shape, 2)?,
            c_in: dim(shape, 3)?,
        })
    }
}

/// NHWC activation map; the batch dimension does not enter any formula.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FeatureMapShape {
    pub h_out: u64,
    pub w_out: u64,
    pub c_out: u64,
}

impl FeatureMapShape {
    pub(crate) fn from_shape(shape: &Shape) -> Result<Self, Error> {
        Ok(FeatureMapShape {
            h_out: dim(shape, 1)?,
            w_out: dim(shape, 2)?,
            c_out: dim(shape, 3)?,
        })
    }
}

/// Fully-connected weight laid out as (out-features, in-features).
#[derive(Debug, Clone, Copy)]
pub(crate) struct WeightShape {
    pub out_features: u64,
    pub in_features: u64,
}

impl WeightShape {
    pub(crate) fn from_shape(shape: &Shape) -> Result<Self, Error> {
        Ok(WeightShape {
            out_features: dim(shape, 0)?,
            in_features: dim(shape, 1)?,
        })
    }
}

/// Batch size of a fully-connected input, shape (batch, in-features).
pub(crate) fn batch_size(input_shape: &Shape) -> Result<u64, Error> {
    dim(input_shape, 0)
}

/// One multiply + one add per output element per filter weight.
pub(crate) fn conv_2d(filter: &FilterShape, out: &FeatureMapShape) -> u64 {
    2 * out.h_out * out.w_out * filter.c_out * filter.k_h * filter.k_w * filter.c_in
}

/// One filter per channel, so the channel count does not multiply output
/// channels.
pub(crate) fn depthwise_conv_2d(filter: &FilterShape, out: &FeatureMapShape) -> u64 {
    2 * out.h_out * out.w_out * filter.c_in * filter.k_h * filter.k_w
}

/// K·K−1 comparisons per pooled window.
pub(crate) fn max_pool_2d(k_h: u64, k_w: u64, out: &FeatureMapShape) -> u64 {
    (k_h * k_w).saturating_sub(1) * out.h_out * out.w_out * out.c_out
}

/// K·K−1 adds plus one divide, approximated as K·K ops per window.
pub(crate) fn average_pool_2d(k_h: u64, k_w: u64, out: &FeatureMapShape) -> u64 {
    k_h * k_w * out.h_out * out.w_out * out.c_out
}

/// One multiply-add per (batch, in, out) triple.
pub(crate) fn fully_connected(batch: u64, weight: &WeightShape) -> u64 {
    2 * batch * weight.in_features * weight.out_features
}
