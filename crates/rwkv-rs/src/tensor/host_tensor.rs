//! Immutable host tensor used for model weights and test fixtures.

use rand::Rng;
use std::sync::Arc;

use super::shape::Shape;
use crate::error::{ErrorFlags, RwkvError, RwkvResult};

/// Read-only `F32` tensor whose payload is shared between clones.
///
/// Weights are handed to graphs by reference; cloning a `HostTensor` never copies data.
#[derive(Debug, Clone)]
pub struct HostTensor {
    shape: Shape,
    data: Arc<[f32]>,
}

impl HostTensor {
    /// Constructs a tensor from raw values, validating the length against the shape.
    pub fn from_vec(shape: Shape, data: Vec<f32>) -> RwkvResult<Self> {
        if data.len() != shape.num_elements() {
            return Err(RwkvError::model(
                ErrorFlags::ARGS | ErrorFlags::DIMENSION,
                format!(
                    "tensor data length ({}) does not match shape {:?}",
                    data.len(),
                    shape.dims()
                ),
            ));
        }
        Ok(HostTensor {
            shape,
            data: data.into(),
        })
    }

    /// Returns a tensor filled with `value`.
    pub fn full(shape: Shape, value: f32) -> Self {
        HostTensor {
            shape,
            data: vec![value; shape.num_elements()].into(),
        }
    }

    /// Returns a zero-initialized tensor of the requested shape.
    pub fn zeros(shape: Shape) -> Self {
        HostTensor::full(shape, 0.0)
    }

    /// Returns a one-initialized tensor of the requested shape.
    pub fn ones(shape: Shape) -> Self {
        HostTensor::full(shape, 1.0)
    }

    /// Samples from a normal distribution (`N(0, std^2)`) using the Box-Muller transform.
    pub fn randn(shape: Shape, std: f32, rng: &mut impl Rng) -> Self {
        let len = shape.num_elements();
        let mut values = Vec::with_capacity(len);
        while values.len() < len {
            let u1: f32 = rng.gen::<f32>().max(f32::MIN_POSITIVE);
            let u2: f32 = rng.gen::<f32>();
            let r = (-2.0 * u1.ln()).sqrt();
            let theta = 2.0 * std::f32::consts::PI * u2;
            values.push(r * theta.cos() * std);
            if values.len() < len {
                values.push(r * theta.sin() * std);
            }
        }
        HostTensor {
            shape,
            data: values.into(),
        }
    }

    /// Samples uniformly from `[low, high)`.
    pub fn uniform(shape: Shape, low: f32, high: f32, rng: &mut impl Rng) -> Self {
        let values: Vec<f32> = (0..shape.num_elements())
            .map(|_| low + (high - low) * rng.gen::<f32>())
            .collect();
        HostTensor {
            shape,
            data: values.into(),
        }
    }

    /// Applies `f` to every element, producing a new tensor of the same shape.
    pub fn map(&self, f: impl Fn(f32) -> f32) -> Self {
        HostTensor {
            shape: self.shape,
            data: self.data.iter().map(|&v| f(v)).collect(),
        }
    }

    /// Reinterprets the payload under a new shape with the same element count.
    pub fn reshape(&self, shape: Shape) -> RwkvResult<Self> {
        if shape.num_elements() != self.len() {
            return Err(RwkvError::model(
                ErrorFlags::ARGS | ErrorFlags::SHAPE,
                format!(
                    "cannot reshape {:?} into {:?}",
                    self.shape.dims(),
                    shape.dims()
                ),
            ));
        }
        Ok(HostTensor {
            shape,
            data: Arc::clone(&self.data),
        })
    }

    /// Returns the total number of elements stored in the tensor.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Reports whether the tensor contains zero elements.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn from_vec_rejects_length_mismatch() {
        let err = HostTensor::from_vec(Shape::new([2, 2]), vec![1.0; 3]).unwrap_err();
        assert_eq!(err.flags(), ErrorFlags::ARGS | ErrorFlags::DIMENSION);
    }

    #[test]
    fn reshape_shares_payload() {
        let tensor = HostTensor::from_vec(Shape::new([2, 3]), (0..6).map(|v| v as f32).collect())
            .unwrap();
        let reshaped = tensor.reshape(Shape::new([6])).unwrap();
        assert_eq!(reshaped.data().as_ptr(), tensor.data().as_ptr());
        assert!(tensor.reshape(Shape::new([4])).is_err());
    }

    #[test]
    fn randn_is_reproducible_for_a_seed() {
        let a = HostTensor::randn(Shape::new([5]), 0.02, &mut StdRng::seed_from_u64(42));
        let b = HostTensor::randn(Shape::new([5]), 0.02, &mut StdRng::seed_from_u64(42));
        assert_eq!(a.data(), b.data());
    }
}
