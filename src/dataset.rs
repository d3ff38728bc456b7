/* ------------------------------------------------------------------ */
/* Datasets: batches, the generator trait, CIFAR binary readers       */
/* ------------------------------------------------------------------ */
//
// Images are kept as raw u8 CHW planes and normalized per batch:
//   x = (pixel / 255 - mean[c]) / std[c]
// Training batches may be augmented with a random crop from the image
// zero-padded by CROP_PADDING pixels on every side, plus a random
// horizontal flip.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use candle_core::{Device, Tensor};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::info;

use crate::config::CROP_PADDING;
use crate::embedding::ClassLabel;
use crate::error::{Error, Result};
use crate::loss::HeadTarget;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Split {
    Train,
    Validation,
    Test,
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Split::Train => "train",
            Split::Validation => "val",
            Split::Test => "test",
        })
    }
}

/* ------------------------------------------------------------------ */
/* Batch                                                              */
/* ------------------------------------------------------------------ */

#[derive(Debug, Clone)]
pub struct Batch {
    /// `[B, C, H, W]`, f32, normalized.
    pub images: Tensor,
    pub labels: Vec<u32>,
    /// Sample indices within the split.
    pub indices: Vec<usize>,
    /// One target per model head, attached by the batch transform.
    pub targets: Vec<HeadTarget>,
}

/// Hook run on every batch before it is handed to the consumer.
pub type BatchTransform = Arc<dyn Fn(&mut Batch) -> Result<()> + Send + Sync>;

impl Batch {
    pub fn new(images: Tensor, labels: Vec<u32>, indices: Vec<usize>) -> Self {
        Self { images, labels, indices, targets: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Rows `start..start + len` of every tensor.
    pub fn narrow(&self, start: usize, len: usize) -> Result<Batch> {
        let end = start + len;
        if end > self.len() {
            return Err(Error::Dataset(format!(
                "batch slice {start}..{end} out of range for {} samples",
                self.len()
            )));
        }
        Ok(Batch {
            images: self.images.narrow(0, start, len)?,
            labels: self.labels[start..end].to_vec(),
            indices: self.indices[start..end].to_vec(),
            targets: self
                .targets
                .iter()
                .map(|t| t.map(|x| x.narrow(0, start, len)))
                .collect::<Result<_>>()?,
        })
    }

    pub fn to_device(&self, device: &Device) -> Result<Batch> {
        Ok(Batch {
            images: self.images.to_device(device)?,
            labels: self.labels.clone(),
            indices: self.indices.clone(),
            targets: self
                .targets
                .iter()
                .map(|t| t.map(|x| x.to_device(device)))
                .collect::<Result<_>>()?,
        })
    }
}

/* ------------------------------------------------------------------ */
/* Generator trait                                                    */
/* ------------------------------------------------------------------ */

pub trait DataGenerator: Send + Sync {
    fn num_classes(&self) -> usize;

    fn num_samples(&self, split: Split) -> usize;

    /// (channels, height, width)
    fn image_shape(&self) -> (usize, usize, usize);

    /// Load the given samples of `split`. `augment` seeds the random
    /// crop/flip; `None` yields the plain normalized images.
    fn load_batch(&self, split: Split, indices: &[usize], augment: Option<u64>) -> Result<Batch>;

    fn num_batches(&self, split: Split, batch_size: usize) -> usize {
        self.num_samples(split).div_ceil(batch_size.max(1))
    }
}

/* ------------------------------------------------------------------ */
/* In-memory image arrays                                             */
/* ------------------------------------------------------------------ */

#[derive(Debug, Clone, Default)]
pub struct SplitData {
    /// N × C × H × W bytes.
    pub images: Vec<u8>,
    pub labels: Vec<u32>,
}

impl SplitData {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ArrayDataset {
    train: SplitData,
    test: SplitData,
    shape: (usize, usize, usize),
    num_classes: usize,
    mean: Vec<f32>,
    std: Vec<f32>,
}

impl ArrayDataset {
    pub fn new(
        train: SplitData,
        test: SplitData,
        shape: (usize, usize, usize),
        num_classes: usize,
        mean: Vec<f32>,
        std: Vec<f32>,
    ) -> Result<Self> {
        let (c, h, w) = shape;
        let pixels = c * h * w;
        if pixels == 0 {
            return Err(Error::Dataset("images must have a non-empty shape".into()));
        }
        if mean.len() != c || std.len() != c || std.iter().any(|s| !(*s > 0.0)) {
            return Err(Error::Dataset(format!(
                "need {c} channel means and positive standard deviations"
            )));
        }
        for (name, split) in [("train", &train), ("test", &test)] {
            if split.images.len() != split.len() * pixels {
                return Err(Error::Dataset(format!(
                    "{name} split holds {} bytes for {} images of {pixels} pixels",
                    split.images.len(),
                    split.len()
                )));
            }
            if let Some(bad) = split.labels.iter().find(|&&l| l as usize >= num_classes) {
                return Err(Error::Dataset(format!(
                    "{name} label {bad} out of range for {num_classes} classes"
                )));
            }
        }
        Ok(Self { train, test, shape, num_classes, mean, std })
    }

    fn split(&self, split: Split) -> &SplitData {
        match split {
            Split::Train => &self.train,
            // no separate validation data: validate on the test split
            Split::Validation | Split::Test => &self.test,
        }
    }

    /// Keep only the classes listed in `classes` and renumber them by
    /// their position in that list. Integer labels name native class
    /// indices, string labels name entries of `names`.
    pub fn restrict(self, classes: &[ClassLabel], names: &[String]) -> Result<Self> {
        let mut remap: Vec<Option<u32>> = vec![None; self.num_classes];
        for (new, label) in classes.iter().enumerate() {
            let native = match label {
                ClassLabel::Index(i) => usize::try_from(*i).ok().filter(|&i| i < self.num_classes),
                ClassLabel::Name(n) => names.iter().position(|known| known == n),
            }
            .ok_or_else(|| Error::Dataset(format!("class {label} does not exist in the dataset")))?;
            if let Some(prev) = remap[native].replace(new as u32) {
                return Err(Error::Dataset(format!(
                    "class {label} names the same dataset class as {}",
                    classes[prev as usize]
                )));
            }
        }

        let pixels = self.shape.0 * self.shape.1 * self.shape.2;
        let filter = |data: SplitData| -> SplitData {
            let mut out = SplitData::default();
            for (i, &label) in data.labels.iter().enumerate() {
                if let Some(new) = remap[label as usize] {
                    out.images.extend_from_slice(&data.images[i * pixels..(i + 1) * pixels]);
                    out.labels.push(new);
                }
            }
            out
        };
        let (train, test) = (filter(self.train), filter(self.test));
        Self::new(train, test, self.shape, classes.len(), self.mean, self.std)
    }
}

impl DataGenerator for ArrayDataset {
    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn num_samples(&self, split: Split) -> usize {
        self.split(split).len()
    }

    fn image_shape(&self) -> (usize, usize, usize) {
        self.shape
    }

    fn load_batch(&self, split: Split, indices: &[usize], augment: Option<u64>) -> Result<Batch> {
        let data = self.split(split);
        let (c, h, w) = self.shape;
        let pixels = c * h * w;
        let mut rng = augment.map(ChaCha8Rng::seed_from_u64);

        let mut out = Vec::with_capacity(indices.len() * pixels);
        let mut labels = Vec::with_capacity(indices.len());
        for &idx in indices {
            let label = *data.labels.get(idx).ok_or_else(|| {
                Error::Dataset(format!("{split} index {idx} out of range ({} samples)", data.len()))
            })?;
            labels.push(label);
            let img = &data.images[idx * pixels..(idx + 1) * pixels];

            let pad = CROP_PADDING as isize;
            let (dy, dx, flip) = match rng.as_mut() {
                Some(rng) => {
                (rng.gen_range(-pad..=pad), rng.gen_range(-pad..=pad), rng.gen_bool(0.5))
            }
                None => (0, 0, false),
            };

            for ch in 0..c {
                let plane = &img[ch * h * w..(ch + 1) * h * w];
                for y in 0..h {
                    for x in 0..w {
                        let col = if flip { w - 1 - x } else { x };
                        let sx = col as isize + dx;
                        let sy = y as isize + dy;
                        let v = if sy < 0 || sx < 0 || sy >= h as isize || sx >= w as isize {
                            0.0
                        } else {
                            let px = plane[sy as usize * w + sx as usize] as f32 / 255.0;
                            (px - self.mean[ch]) / self.std[ch]
                        };
                        out.push(v);
                    }
                }
            }
        }

        let images = Tensor::from_vec(out, (indices.len(), c, h, w), &Device::Cpu)?;
        Ok(Batch::new(images, labels, indices.to_vec()))
    }
}

/* ------------------------------------------------------------------ */
/* CIFAR binary format                                                */
/* ------------------------------------------------------------------ */

pub const DATASETS: &[&str] = &["CIFAR-10", "CIFAR-100"];

const CIFAR_SHAPE: (usize, usize, usize) = (3, 32, 32);
const CIFAR_PIXELS: usize = 3 * 32 * 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetKind {
    Cifar10,
    Cifar100,
}

struct CifarLayout {
    subdir: &'static str,
    train_files: &'static [&'static str],
    test_file: &'static str,
    names_file: &'static str,
    label_bytes: usize,
    // byte within the label prefix holding the class
    label_offset: usize,
    num_classes: usize,
    mean: [f32; 3],
    std: [f32; 3],
}

impl DatasetKind {
    fn layout(&self) -> CifarLayout {
        match self {
            DatasetKind::Cifar10 => CifarLayout {
                subdir: "cifar-10-batches-bin",
                train_files: &[
                    "data_batch_1.bin",
                    "data_batch_2.bin",
                    "data_batch_3.bin",
                    "data_batch_4.bin",
                    "data_batch_5.bin",
                ],
                test_file: "test_batch.bin",
                names_file: "batches.meta.txt",
                label_bytes: 1,
                label_offset: 0,
                num_classes: 10,
                mean: [0.4914, 0.4822, 0.4465],
                std: [0.2470, 0.2435, 0.2616],
            },
            DatasetKind::Cifar100 => CifarLayout {
                subdir: "cifar-100-binary",
                train_files: &["train.bin"],
                test_file: "test.bin",
                names_file: "fine_label_names.txt",
                label_bytes: 2,
                label_offset: 1,
                num_classes: 100,
                mean: [0.5071, 0.4865, 0.4409],
                std: [0.2673, 0.2564, 0.2762],
            },
        }
    }
}

impl FromStr for DatasetKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().replace(['-', '_'], "").as_str() {
            "CIFAR10" => Ok(Self::Cifar10),
            "CIFAR100" => Ok(Self::Cifar100),
            other => Err(Error::config(format!(
                "unknown dataset {other:?} (expected one of {})",
                DATASETS.join(", ")
            ))),
        }
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Cifar10 => "CIFAR-10",
            Self::Cifar100 => "CIFAR-100",
        })
    }
}

fn locate(root: &Path, layout: &CifarLayout) -> Result<PathBuf> {
    [root.to_path_buf(), root.join(layout.subdir)]
        .into_iter()
        .find(|dir| dir.join(layout.test_file).is_file())
        .ok_or_else(|| {
            Error::Dataset(format!(
                "{} not found in {} or {}",
                layout.test_file,
                root.display(),
                root.join(layout.subdir).display()
            ))
        })
}

fn read_records(path: &Path, layout: &CifarLayout, into: &mut SplitData) -> Result<()> {
    let raw = std::fs::read(path)
        .map_err(|e| Error::Dataset(format!("cannot read {}: {e}", path.display())))?;
    let record = layout.label_bytes + CIFAR_PIXELS;
    if raw.len() % record != 0 {
        return Err(Error::Dataset(format!(
            "{} is {} bytes, not a multiple of the {record}-byte record",
            path.display(),
            raw.len()
        )));
    }
    for rec in raw.chunks_exact(record) {
        into.labels.push(rec[layout.label_offset] as u32);
        into.images.extend_from_slice(&rec[layout.label_bytes..]);
    }
    Ok(())
}

fn read_names(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .map(|s| s.lines().map(str::trim).filter(|l| !l.is_empty()).map(String::from).collect())
        .unwrap_or_default()
}

/// Load a dataset from `root` restricted to (and indexed by) `classes`.
pub fn open(
    kind: DatasetKind,
    root: impl AsRef<Path>,
    classes: &[ClassLabel],
) -> Result<ArrayDataset> {
    let layout = kind.layout();
    let dir = locate(root.as_ref(), &layout)?;

    let mut train = SplitData::default();
    for file in layout.train_files {
        read_records(&dir.join(file), &layout, &mut train)?;
    }
    let mut test = SplitData::default();
    read_records(&dir.join(layout.test_file), &layout, &mut test)?;
    let names = read_names(&dir.join(layout.names_file));

    info!(
        dataset = %kind,
        train = train.len(),
        test = test.len(),
        "loaded {}",
        dir.display()
    );

    let full = ArrayDataset::new(
        train,
        test,
        CIFAR_SHAPE,
        layout.num_classes,
        layout.mean.to_vec(),
        layout.std.to_vec(),
    )?;
    full.restrict(classes, &names)
}

#[cfg(test)]
mod tests {
    use super::*;

    // 3 classes of 2x2 single-channel images whose pixels equal 10·label + i
    fn tiny() -> ArrayDataset {
        let split = |n: usize| {
            let mut data = SplitData::default();
            for i in 0..n {
                let label = (i % 3) as u32;
                data.labels.push(label);
                data.images.extend((0..4).map(|p| (10 * label as usize + p) as u8));
            }
            data
        };
        ArrayDataset::new(split(7), split(4), (1, 2, 2), 3, vec![0.0], vec![1.0 / 255.0]).unwrap()
    }

    #[test]
    fn load_batch_normalizes_in_order() {
        let data = tiny();
        let batch = data.load_batch(Split::Train, &[2, 0], None).unwrap();
        assert_eq!(batch.labels, vec![2, 0]);
        assert_eq!(batch.images.dims(), &[2, 1, 2, 2]);
        let flat: Vec<f32> = batch.images.flatten_all().unwrap().to_vec1().unwrap();
        let expected = [20.0, 21.0, 22.0, 23.0, 0.0, 1.0, 2.0, 3.0];
        for (a, b) in flat.iter().zip(expected) {
            assert!((a - b).abs() < 1e-3, "{a} vs {b}");
        }
    }

    #[test]
    fn augmentation_is_deterministic_per_seed() {
        let data = tiny();
        let a = data.load_batch(Split::Train, &[0, 1, 2], Some(7)).unwrap();
        let b = data.load_batch(Split::Train, &[0, 1, 2], Some(7)).unwrap();
        let a: Vec<f32> = a.images.flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = b.images.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn batch_counts_round_up() {
        let data = tiny();
        assert_eq!(data.num_batches(Split::Train, 3), 3);
        assert_eq!(data.num_batches(Split::Test, 4), 1);
        assert_eq!(data.num_samples(Split::Validation), 4);
    }

    #[test]
    fn restrict_renumbers_by_table_order() {
        let names = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let data = tiny()
            .restrict(&[ClassLabel::Name("c".into()), ClassLabel::Index(0)], &names)
            .unwrap();
        assert_eq!(data.num_classes(), 2);
        // train labels 0,1,2,0,1,2,0 → keep 0 and 2 → 5 samples
        assert_eq!(data.num_samples(Split::Train), 5);
        let batch = data.load_batch(Split::Train, &[0, 1], None).unwrap();
        assert_eq!(batch.labels, vec![1, 0]);
    }

    #[test]
    fn unknown_table_class_is_an_error() {
        assert!(tiny().restrict(&[ClassLabel::Index(5)], &[]).is_err());
        assert!(tiny().restrict(&[ClassLabel::Name("zebra".into())], &[]).is_err());
    }

    #[test]
    fn class_named_twice_is_an_error() {
        let names = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let classes = [ClassLabel::Index(2), ClassLabel::Index(0), ClassLabel::Name("c".into())];
        let err = tiny().restrict(&classes, &names).err().unwrap();
        match err {
            Error::Dataset(msg) => assert!(msg.contains("same dataset class as 2"), "{msg}"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn narrow_slices_every_field() {
        let data = tiny();
        let batch = data.load_batch(Split::Test, &[0, 1, 2, 3], None).unwrap();
        let part = batch.narrow(1, 2).unwrap();
        assert_eq!(part.labels, vec![1, 2]);
        assert_eq!(part.indices, vec![1, 2]);
        assert_eq!(part.images.dims(), &[2, 1, 2, 2]);
        assert!(batch.narrow(3, 2).is_err());
    }

    #[test]
    fn cifar10_binary_records_are_parsed() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("cifar-10-batches-bin");
        std::fs::create_dir(&sub).unwrap();
        let record = |label: u8| {
            let mut r = vec![label];
            r.extend(std::iter::repeat(label * 20).take(CIFAR_PIXELS));
            r
        };
        for i in 1..=5 {
            let path = sub.join(format!("data_batch_{i}.bin"));
            std::fs::write(path, [record(1), record(3)].concat()).unwrap();
        }
        std::fs::write(sub.join("test_batch.bin"), [record(3), record(9)].concat()).unwrap();
        let names = (0..10).map(|i| format!("class{i}")).collect::<Vec<_>>().join("\n");
        std::fs::write(sub.join("batches.meta.txt"), names).unwrap();

        let classes = [ClassLabel::Index(3), ClassLabel::Name("class1".into())];
        let data = open(DatasetKind::Cifar10, dir.path(), &classes).unwrap();
        assert_eq!(data.num_classes(), 2);
        assert_eq!(data.num_samples(Split::Train), 10);
        // class 9 is not in the table
        assert_eq!(data.num_samples(Split::Test), 1);
        assert_eq!(data.image_shape(), (3, 32, 32));
        let batch = data.load_batch(Split::Train, &[0, 1], None).unwrap();
        assert_eq!(batch.labels, vec![1, 0]);
    }

    #[test]
    fn dataset_names_parse() {
        assert_eq!("cifar-100".parse::<DatasetKind>().unwrap(), DatasetKind::Cifar100);
        assert_eq!("CIFAR10".parse::<DatasetKind>().unwrap(), DatasetKind::Cifar10);
        assert!(matches!("imagenet".parse::<DatasetKind>(), Err(Error::Config(_))));
    }
}
