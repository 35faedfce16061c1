use rand::Rng;
use tch::Tensor;

/// History buffer of generated images fed to the discriminators.
///
/// Once full, each queried image is returned as-is with probability 0.5,
/// otherwise it replaces a random stored image and the stored one is
/// returned instead. A pool of size 0 passes images through.
#[derive(Debug)]
pub struct ImagePool {
    size: usize,
    images: Vec<Tensor>,
}

impl ImagePool {
    pub fn new(size: usize) -> Self {
        ImagePool {
            size,
            images: Vec::with_capacity(size),
        }
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Returns a batch of detached images drawn from `images` and the history.
    pub fn query(&mut self, images: &Tensor) -> Tensor {
        if self.size == 0 {
            return images.detach();
        }
        let mut rng = rand::thread_rng();
        let batch = images.size()[0];

        let mut out = Vec::with_capacity(batch as usize);
        for k in 0..batch {
            let image = images.get(k).detach().unsqueeze(0);
            if self.images.len() < self.size {
                self.images.push(image.shallow_clone());
                out.push(image);
            } else if rng.gen_bool(0.5) {
                let index = rng.gen_range(0..self.images.len());
                out.push(std::mem::replace(&mut self.images[index], image));
            } else {
                out.push(image);
            }
        }
        Tensor::cat(&out, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    #[test]
    fn pool_is_bounded_and_detached() {
        let mut pool = ImagePool::new(3);
        for _ in 0..5 {
            let fake = Tensor::randn([2, 3, 4, 4], (Kind::Float, Device::Cpu)).set_requires_grad(true);
            let out = pool.query(&(&fake * 2.0));
            assert_eq!(out.size(), vec![2, 3, 4, 4]);
            assert!(!out.requires_grad());
            assert!(pool.len() <= 3);
        }
        assert_eq!(pool.len(), 3);
    }

    #[test]
    fn empty_pool_passes_through() {
        let mut pool = ImagePool::new(0);
        let fake = Tensor::randn([2, 3, 4, 4], (Kind::Float, Device::Cpu));
        assert!(pool.query(&fake).equal(&fake));
        assert!(pool.is_empty());
    }
}
