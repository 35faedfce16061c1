//! Region-of-interest cropping and compositing driven by label masks.

use tch::{Kind, Tensor};

use crate::error::MaskError;
use crate::ops::resize_bilinear;

/// Inclusive, axis-aligned box around the foreground of a mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    pub y_min: i64,
    pub y_max: i64,
    pub x_min: i64,
    pub x_max: i64,
}

impl BoundingBox {
    pub fn height(&self) -> i64 {
        self.y_max - self.y_min + 1
    }

    pub fn width(&self) -> i64 {
        self.x_max - self.x_min + 1
    }

    pub fn contains(&self, y: i64, x: i64) -> bool {
        (self.y_min..=self.y_max).contains(&y) && (self.x_min..=self.x_max).contains(&x)
    }
}

/// Brings a label tensor to `[N, H, W]` class ids.
pub fn normalize_labels(labels: &Tensor) -> Tensor {
    let labels = if labels.dim() == 4 {
        labels.squeeze_dim(1)
    } else {
        labels.shallow_clone()
    };
    labels.to_kind(Kind::Int64)
}

/// Tight bounding box of the nonzero pixels of a `[H, W]` mask.
///
/// `index` is the position of the mask in its batch, for error reporting.
pub fn bounding_box(mask: &Tensor, index: i64) -> Result<BoundingBox, MaskError> {
    let positions = mask.gt(0).nonzero();
    if positions.size()[0] == 0 {
        return Err(MaskError::EmptyMask { index });
    }
    let ys = positions.select(1, 0);
    let xs = positions.select(1, 1);

    Ok(BoundingBox {
        y_min: ys.min().int64_value(&[]),
        y_max: ys.max().int64_value(&[]),
        x_min: xs.min().int64_value(&[]),
        x_max: xs.max().int64_value(&[]),
    })
}

/// Crops a `[C, H, W]` image to `bbox` and resizes it to `height x width`.
pub fn crop_resize(image: &Tensor, bbox: &BoundingBox, height: i64, width: i64) -> Tensor {
    let crop = image
        .narrow(1, bbox.y_min, bbox.height())
        .narrow(2, bbox.x_min, bbox.width())
        .unsqueeze(0);
    resize_bilinear(&crop, height, width).squeeze_dim(0)
}

fn check_shapes(images: &Tensor, labels: &Tensor) -> Result<(), MaskError> {
    let image = images.size();
    let label = labels.size();
    let matches = image.len() == 4
        && label.len() == 3
        && image[0] == label[0]
        && image[2..] == label[1..];
    if matches {
        Ok(())
    } else {
        Err(MaskError::ShapeMismatch { image, label })
    }
}

/// Crops the labeled region of every image and resizes it to the full
/// image resolution.
///
/// Returns the `[N, C, H, W]` patches and the box of each batch item.
pub fn extract_patches(
    images: &Tensor,
    labels: &Tensor,
) -> Result<(Tensor, Vec<BoundingBox>), MaskError> {
    check_shapes(images, labels)?;
    let size = images.size();
    let (batch, height, width) = (size[0], size[2], size[3]);

    let mut patches = Vec::with_capacity(batch as usize);
    let mut boxes = Vec::with_capacity(batch as usize);
    for k in 0..batch {
        let bbox = bounding_box(&labels.get(k), k)?;
        patches.push(crop_resize(&images.get(k), &bbox, height, width));
        boxes.push(bbox);
    }
    Ok((Tensor::stack(&patches, 0), boxes))
}

/// Keeps only the pixels outside the mask, zeroing the foreground.
pub fn out_of_mask(images: &Tensor, labels: &Tensor) -> Tensor {
    images * labels.eq(0).unsqueeze(1).to_kind(images.kind())
}

/// Keeps only the foreground pixels.
pub fn in_mask(images: &Tensor, labels: &Tensor) -> Tensor {
    images * labels.gt(0).unsqueeze(1).to_kind(images.kind())
}

/// Pastes generated patches back into their boxes.
///
/// Each `[C, H, W]` patch of `generated` is resized to its box and replaces
/// that region of `background` (the out-of-mask real image); everything
/// outside the box is taken from `background` unchanged. Built from padding
/// and masking so gradients reach `generated`.
pub fn paste_patches(generated: &Tensor, background: &Tensor, boxes: &[BoundingBox]) -> Tensor {
    let size = background.size();
    let (height, width) = (size[2], size[3]);
    let options = (generated.kind(), generated.device());

    let composites: Vec<Tensor> = boxes
        .iter()
        .enumerate()
        .map(|(k, bbox)| {
            let k = k as i64;
            let pad = [
                bbox.x_min,
                width - bbox.x_max - 1,
                bbox.y_min,
                height - bbox.y_max - 1,
            ];
            let patch = resize_bilinear(&generated.get(k).unsqueeze(0), bbox.height(), bbox.width())
                .constant_pad_nd(pad);
            let inside = Tensor::ones([1, 1, bbox.height(), bbox.width()], options)
                .constant_pad_nd(pad);
            let outside = inside.ones_like() - &inside;
            patch + background.get(k).unsqueeze(0) * outside
        })
        .collect();

    Tensor::cat(&composites, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, IndexOp};

    fn labels_with_box(batch: i64, size: i64, bbox: BoundingBox) -> Tensor {
        let labels = Tensor::zeros([batch, size, size], (Kind::Int64, Device::Cpu));
        let _ = labels
            .i((.., bbox.y_min..bbox.y_max + 1, bbox.x_min..bbox.x_max + 1))
            .fill_(1);
        labels
    }

    #[test]
    fn bounding_box_is_tight_for_irregular_masks() {
        // An L-shaped mask: the first and last nonzero pixels in raster order
        // are not the horizontal extrema.
        let mask = Tensor::zeros([8, 8], (Kind::Int64, Device::Cpu));
        let _ = mask.i((1, 4)).fill_(1);
        let _ = mask.i((3, 1..7)).fill_(1);
        let _ = mask.i((6, 2)).fill_(1);

        let bbox = bounding_box(&mask, 0).unwrap();
        assert_eq!(
            bbox,
            BoundingBox {
                y_min: 1,
                y_max: 6,
                x_min: 1,
                x_max: 6
            }
        );

        let positions = mask.nonzero();
        for i in 0..positions.size()[0] {
            let y = positions.int64_value(&[i, 0]);
            let x = positions.int64_value(&[i, 1]);
            assert!(bbox.contains(y, x));
        }
    }

    #[test]
    fn empty_mask_is_an_error() {
        let mask = Tensor::zeros([4, 4], (Kind::Int64, Device::Cpu));
        assert!(matches!(
            bounding_box(&mask, 3),
            Err(MaskError::EmptyMask { index: 3 })
        ));
    }

    #[test]
    fn full_frame_crop_resize_is_identity() {
        let images = Tensor::rand([4, 3, 256, 256], (Kind::Float, Device::Cpu)) * 2.0 - 1.0;
        let labels = Tensor::ones([4, 256, 256], (Kind::Int64, Device::Cpu));
        let (patches, boxes) = extract_patches(&images, &labels).unwrap();
        assert!(boxes.iter().all(|b| b.height() == 256 && b.width() == 256));
        assert!(patches.allclose(&images, 1e-5, 1e-6, false));
    }

    #[test]
    fn composite_keeps_background_outside_the_box() {
        let bbox = BoundingBox {
            y_min: 2,
            y_max: 5,
            x_min: 3,
            x_max: 6,
        };
        let labels = labels_with_box(2, 8, bbox);
        let images = Tensor::randn([2, 3, 8, 8], (Kind::Float, Device::Cpu));
        let generated = Tensor::randn([2, 3, 8, 8], (Kind::Float, Device::Cpu));

        let background = out_of_mask(&images, &labels);
        let composite = paste_patches(&generated, &background, &[bbox, bbox]);

        let resized = resize_bilinear(&generated, bbox.height(), bbox.width());
        let inside = composite.i((.., .., 2..6, 3..7));
        assert!(inside.allclose(&resized, 1e-6, 1e-6, false));

        let box_mask = labels.unsqueeze(1).to_kind(Kind::Float);
        let outside_composite = &composite * (box_mask.ones_like() - &box_mask);
        let outside_real = &images * (box_mask.ones_like() - &box_mask);
        assert!(outside_composite.equal(&outside_real));
    }

    #[test]
    fn composite_passes_gradients_to_the_generated_patch() {
        let bbox = BoundingBox {
            y_min: 0,
            y_max: 3,
            x_min: 0,
            x_max: 3,
        };
        let background = Tensor::zeros([1, 3, 8, 8], (Kind::Float, Device::Cpu));
        let generated =
            Tensor::randn([1, 3, 8, 8], (Kind::Float, Device::Cpu)).set_requires_grad(true);
        let composite = paste_patches(&generated, &background, &[bbox]);
        composite.sum(Kind::Float).backward();
        assert!(generated.grad().abs().sum(Kind::Float).double_value(&[]) > 0.0);
    }

    #[test]
    fn mismatched_labels_are_rejected() {
        let images = Tensor::zeros([2, 3, 8, 8], (Kind::Float, Device::Cpu));
        let labels = Tensor::ones([2, 4, 4], (Kind::Int64, Device::Cpu));
        assert!(matches!(
            extract_patches(&images, &labels),
            Err(MaskError::ShapeMismatch { .. })
        ));
    }
}
