use tch::{nn, nn::ModuleT, Tensor};

use crate::instance_norm::InstanceNorm2d;
use crate::ops::resize_bilinear;

fn conv_block(vs: &nn::Path, in_c: i64, out_c: i64) -> nn::SequentialT {
    let config = nn::ConvConfig {
        padding: 1,
        ..Default::default()
    };
    nn::seq_t()
        .add(nn::conv2d(vs / "conv1", in_c, out_c, 3, config))
        .add(InstanceNorm2d::new(&(vs / "norm1"), out_c, true))
        .add_fn(|xs| xs.relu())
        .add(nn::conv2d(vs / "conv2", out_c, out_c, 3, config))
        .add(InstanceNorm2d::new(&(vs / "norm2"), out_c, true))
        .add_fn(|xs| xs.relu())
}

/// Semantic segmentation network `f_s`: a two-level U-Net producing
/// per-pixel class logits `[N, nclasses, H, W]`.
#[derive(Debug)]
pub struct SemanticClassifier {
    enc1: nn::SequentialT,
    enc2: nn::SequentialT,
    bottleneck: nn::SequentialT,
    dec2: nn::SequentialT,
    dec1: nn::SequentialT,
    classes: nn::Conv2D,
}

impl SemanticClassifier {
    pub fn new(vs: &nn::Path, input_nc: i64, nclasses: i64, nf: i64) -> Self {
        SemanticClassifier {
            enc1: conv_block(&(vs / "enc1"), input_nc, nf),
            enc2: conv_block(&(vs / "enc2"), nf, nf * 2),
            bottleneck: conv_block(&(vs / "bottleneck"), nf * 2, nf * 4),
            dec2: conv_block(&(vs / "dec2"), nf * 4 + nf * 2, nf * 2),
            dec1: conv_block(&(vs / "dec1"), nf * 2 + nf, nf),
            classes: nn::conv2d(vs / "classes", nf, nclasses, 1, Default::default()),
        }
    }
}

fn up_and_concat(xs: &Tensor, skip: &Tensor) -> Tensor {
    let size = skip.size();
    Tensor::cat(&[&resize_bilinear(xs, size[2], size[3]), skip], 1)
}

impl ModuleT for SemanticClassifier {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let e1 = self.enc1.forward_t(xs, train);
        let e2 = self.enc2.forward_t(&e1.max_pool2d_default(2), train);
        let b = self.bottleneck.forward_t(&e2.max_pool2d_default(2), train);
        let d2 = self.dec2.forward_t(&up_and_concat(&b, &e2), train);
        let d1 = self.dec1.forward_t(&up_and_concat(&d2, &e1), train);
        d1.apply(&self.classes)
    }
}
