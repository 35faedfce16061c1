use tch::Tensor;

/// Cross-process reduction used to average training statistics.
pub trait Reducer {
    fn world_size(&self) -> i64;

    fn reduce_sum(&self, value: &Tensor) -> Tensor;

    /// `reduce_sum(value) / world_size()` as a scalar.
    fn average(&self, value: &Tensor) -> f64 {
        self.reduce_sum(value).double_value(&[]) / self.world_size() as f64
    }
}

/// Single-process reducer.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalReducer;

impl Reducer for LocalReducer {
    fn world_size(&self) -> i64 {
        1
    }

    fn reduce_sum(&self, value: &Tensor) -> Tensor {
        value.shallow_clone()
    }
}
