use burn::{
    prelude::*,
    tensor::{backend::Backend, TensorData},
};

pub trait BoolToTensor<B: Backend> {
    fn to_bool_tensor(self, device: &B::Device) -> Tensor<B, 1, Bool>;
}

impl<B: Backend> BoolToTensor<B> for Vec<bool> {
    fn to_bool_tensor(self, device: &B::Device) -> Tensor<B, 1, Bool> {
        let len = self.len();
        let int_data: Vec<i32> = self.into_iter().map(|b| if b { 1 } else { 0 }).collect();
        let int_tensor: Tensor<B, 1, Int> =
            Tensor::from_data(TensorData::new(int_data, [len]).convert::<B::IntElem>(), device);
        int_tensor.greater_elem(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::{NdArray, NdArrayDevice};

    #[test]
    fn mask_follows_input() {
        let device = NdArrayDevice::default();
        let mask: Tensor<NdArray, 1, Bool> = vec![true, false, true].to_bool_tensor(&device);

        let values: Vec<i64> = mask.int().into_data().iter::<i64>().collect();
        assert_eq!(values, vec![1, 0, 1]);
    }
}
