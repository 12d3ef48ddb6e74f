use burn::{
    prelude::*,
    tensor::{backend::Backend, BasicOps, Element, TensorData},
};

/// A trait for converting batches of states to tensors of dimension `D`
///
/// Observations from the simulator are `Vec<f32>`, so batches arrive as `Vec<Vec<f32>>`
/// and become `[batch, features]` tensors.
pub trait ToTensor<B: Backend, const D: usize, K: BasicOps<B>> {
    fn to_tensor(self, device: &B::Device) -> Tensor<B, D, K>;
}

impl<B, E, K> ToTensor<B, 2, K> for Vec<Vec<E>>
where
    B: Backend,
    E: Element,
    K: BasicOps<B, Elem = E>,
{
    /// Rows must share the same length; the width is taken from the first row
    #[inline]
    fn to_tensor(self, device: &B::Device) -> Tensor<B, 2, K> {
        let batch_size = self.len();
        let width = self.first().map_or(0, Vec::len);
        let flat: Vec<E> = self.into_iter().flatten().collect();

        Tensor::<B, 2, K>::from_data(TensorData::new(flat, [batch_size, width]), device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::{NdArray, NdArrayDevice};

    #[test]
    fn observations_become_rows() {
        let device = NdArrayDevice::default();

        let observations = vec![vec![0.5_f32, 1.0, 1.5], vec![2.0, 2.5, 3.0]];
        let tensor: Tensor<NdArray, 2> = observations.to_tensor(&device);

        assert_eq!(tensor.shape().dims, [2, 3]);
        assert_eq!(
            tensor.to_data().as_slice::<f32>().unwrap(),
            &[0.5, 1.0, 1.5, 2.0, 2.5, 3.0]
        );
    }

    #[test]
    fn single_observation_is_a_batch_of_one() {
        let device = NdArrayDevice::default();

        let tensor: Tensor<NdArray, 2> = vec![vec![1.0_f32, 2.0, 3.0, 4.0]].to_tensor(&device);
        assert_eq!(tensor.shape().dims, [1, 4]);
    }

    #[test]
    fn int_batches_keep_their_values() {
        let device = NdArrayDevice::default();

        // NdArray stores Int tensors as i64
        let tensor: Tensor<NdArray, 2, Int> = vec![vec![10_i64, 20], vec![30, 40]].to_tensor(&device);

        assert_eq!(tensor.shape().dims, [2, 2]);
        assert_eq!(tensor.to_data().as_slice::<i64>().unwrap(), &[10, 20, 30, 40]);
    }
}
