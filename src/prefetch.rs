/* ------------------------------------------------------------------ */
/* Bounded worker pool that prefetches batches in order               */
/* ------------------------------------------------------------------ */
//
// Workers take a credit, claim the next batch number from a shared
// cursor, build the batch, run the transform hook and push
// `(number, batch)` into the result channel. The consumer reorders by
// number and hands a credit back for every batch it yields, so at most
// `prefetch` batches are claimed but not yet consumed, whatever order
// workers finish in. Dropping the stream closes the credit channel and
// idle workers exit.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{bounded, Receiver, Sender};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::debug;

use crate::config::{DEFAULT_PREFETCH, DEFAULT_SEED, DEFAULT_WORKERS};
use crate::dataset::{Batch, BatchTransform, DataGenerator, Split};
use crate::error::{Error, Result};

#[derive(Clone)]
pub struct FlowOptions {
    pub batch_size: usize,
    pub shuffle: bool,
    pub augment: bool,
    pub seed: u64,
    pub workers: usize,
    /// Capacity of the queue between workers and consumer, in batches.
    pub prefetch: usize,
    pub transform: Option<BatchTransform>,
}

impl FlowOptions {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            shuffle: false,
            augment: false,
            seed: DEFAULT_SEED,
            workers: DEFAULT_WORKERS,
            prefetch: DEFAULT_PREFETCH,
            transform: None,
        }
    }
}

type Slot = (usize, Result<Batch>);

pub struct BatchStream {
    rx: Receiver<Slot>,
    credits: Sender<()>,
    pending: BTreeMap<usize, Result<Batch>>,
    next: usize,
    total: usize,
    stop: Arc<AtomicBool>,
}

impl BatchStream {
    pub fn num_batches(&self) -> usize {
        self.total
    }
}

impl Iterator for BatchStream {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Result<Batch>> {
        if self.next >= self.total {
            return None;
        }
        loop {
            if let Some(batch) = self.pending.remove(&self.next) {
                self.next += 1;
                // Workers may all have exited already; nothing to wake then.
                let _ = self.credits.try_send(());
                return Some(batch);
            }
            match self.rx.recv() {
                Ok((n, batch)) => {
                    self.pending.insert(n, batch);
                }
                Err(_) => {
                    let missing = self.next;
                    self.next = self.total;
                    return Some(Err(Error::Dataset(format!(
                        "data loading workers stopped before batch {missing}"
                    ))));
                }
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.total - self.next;
        (left, Some(left))
    }
}

impl Drop for BatchStream {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

/// Sample order for one epoch: identity, or a seeded shuffle.
pub fn epoch_order(num_samples: usize, shuffle: bool, seed: u64, epoch: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..num_samples).collect();
    if shuffle {
        let mix = (epoch as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        let mut rng = ChaCha8Rng::seed_from_u64(seed ^ mix);
        order.shuffle(&mut rng);
    }
    order
}

/// Stream the batches of one pass over `split`.
pub fn flow(
    data: Arc<dyn DataGenerator>,
    split: Split,
    epoch: usize,
    opts: &FlowOptions,
) -> BatchStream {
    let batch_size = opts.batch_size.max(1);
    let order = Arc::new(epoch_order(data.num_samples(split), opts.shuffle, opts.seed, epoch));
    let total = order.len().div_ceil(batch_size);

    let window = opts.prefetch.max(1);
    let (tx, rx) = bounded::<Slot>(window);
    let (credits, credit_rx) = bounded::<()>(window);
    for _ in 0..window {
        let _ = credits.try_send(());
    }
    let cursor = Arc::new(AtomicUsize::new(0));
    let stop = Arc::new(AtomicBool::new(false));
    let workers = opts.workers.max(1).min(total.max(1));

    for _ in 0..workers {
        let (tx, credit_rx) = (tx.clone(), credit_rx.clone());
        let (data, order) = (Arc::clone(&data), Arc::clone(&order));
        let (cursor, stop) = (Arc::clone(&cursor), Arc::clone(&stop));
        let transform = opts.transform.clone();
        let augment = opts.augment;
        let seed = opts.seed;

        thread::spawn(move || loop {
            if credit_rx.recv().is_err() || stop.load(Ordering::Relaxed) {
                break;
            }
            let n = cursor.fetch_add(1, Ordering::Relaxed);
            if n >= total {
                break;
            }
            let start = n * batch_size;
            let indices = &order[start..(start + batch_size).min(order.len())];
            let augment_seed = augment.then(|| {
                seed.wrapping_add((epoch as u64) << 32).wrapping_add(n as u64)
            });

            // A panicking batch must still reach the consumer, which would
            // otherwise wait for it while idle workers hold the channel open.
            let batch = panic::catch_unwind(AssertUnwindSafe(|| {
                data.load_batch(split, indices, augment_seed).and_then(|mut batch| {
                    if let Some(transform) = &transform {
                        transform(&mut batch)?;
                    }
                    Ok(batch)
                })
            }))
            .unwrap_or_else(|_| Err(Error::Dataset(format!("data loading panicked on batch {n}"))));
            if tx.send((n, batch)).is_err() {
                debug!("batch consumer gone, worker exiting");
                break;
            }
        });
    }

    BatchStream { rx, credits, pending: BTreeMap::new(), next: 0, total, stop }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{ArrayDataset, SplitData};

    fn dataset(n: usize) -> Arc<dyn DataGenerator> {
        let data = SplitData {
            images: (0..n).map(|i| i as u8).collect(),
            labels: (0..n).map(|i| (i % 2) as u32).collect(),
        };
        Arc::new(ArrayDataset::new(data.clone(), data, (1, 1, 1), 2, vec![0.0], vec![1.0]).unwrap())
    }

    #[test]
    fn batches_arrive_in_order_with_short_tail() {
        let mut opts = FlowOptions::new(4);
        opts.workers = 3;
        opts.prefetch = 2;
        let batches: Vec<Batch> =
            flow(dataset(10), Split::Train, 0, &opts).map(|b| b.unwrap()).collect();
        assert_eq!(batches.len(), 3);
        let indices: Vec<usize> = batches.iter().flat_map(|b| b.indices.clone()).collect();
        assert_eq!(indices, (0..10).collect::<Vec<_>>());
        assert_eq!(batches[2].len(), 2);
    }

    #[test]
    fn shuffled_epochs_cover_every_sample_once() {
        let mut opts = FlowOptions::new(3);
        opts.shuffle = true;
        let first: Vec<usize> = flow(dataset(11), Split::Train, 0, &opts)
            .flat_map(|b| b.unwrap().indices)
            .collect();
        let second: Vec<usize> = flow(dataset(11), Split::Train, 1, &opts)
            .flat_map(|b| b.unwrap().indices)
            .collect();
        let mut sorted = first.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..11).collect::<Vec<_>>());
        assert_ne!(first, second);
        assert_eq!(first, epoch_order(11, true, opts.seed, 0));
    }

    #[test]
    fn transform_runs_on_every_batch() {
        let mut opts = FlowOptions::new(2);
        let transform: BatchTransform = Arc::new(|batch: &mut Batch| {
            batch.labels.iter_mut().for_each(|l| *l += 10);
            Ok(())
        });
        opts.transform = Some(transform);
        let labels: Vec<u32> = flow(dataset(4), Split::Test, 0, &opts)
            .flat_map(|b| b.unwrap().labels)
            .collect();
        assert_eq!(labels, vec![10, 11, 10, 11]);
    }

    #[test]
    fn transform_errors_are_delivered_in_place() {
        let mut opts = FlowOptions::new(1);
        opts.transform = Some(Arc::new(|batch: &mut Batch| {
            if batch.indices[0] == 1 {
                Err(Error::Dataset("bad sample".into()))
            } else {
                Ok(())
            }
        }));
        let results: Vec<bool> =
            flow(dataset(3), Split::Train, 0, &opts).map(|b| b.is_ok()).collect();
        assert_eq!(results, vec![true, false, true]);
    }

    #[test]
    fn slow_batch_does_not_let_workers_run_ahead() {
        let loaded = Arc::new(AtomicUsize::new(0));
        let mut opts = FlowOptions::new(1);
        opts.workers = 4;
        opts.prefetch = 2;
        let counter = Arc::clone(&loaded);
        opts.transform = Some(Arc::new(move |batch: &mut Batch| {
            if batch.indices[0] == 0 {
                thread::sleep(std::time::Duration::from_millis(200));
            }
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        let mut stream = flow(dataset(200), Split::Test, 0, &opts);
        assert_eq!(stream.next().unwrap().unwrap().indices, vec![0]);
        thread::sleep(std::time::Duration::from_millis(100));
        assert!(stream.pending.len() <= opts.prefetch);
        assert!(loaded.load(Ordering::SeqCst) <= opts.prefetch + 1);

        let rest: Vec<usize> = stream.flat_map(|b| b.unwrap().indices).collect();
        assert_eq!(rest, (1..200).collect::<Vec<_>>());
    }

    #[test]
    fn panicking_transform_becomes_an_error() {
        let mut opts = FlowOptions::new(1);
        opts.transform = Some(Arc::new(|batch: &mut Batch| {
            assert_ne!(batch.indices[0], 2, "corrupt sample");
            Ok(())
        }));
        let results: Vec<bool> =
            flow(dataset(4), Split::Train, 0, &opts).map(|b| b.is_ok()).collect();
        assert_eq!(results, vec![true, true, false, true]);
    }

    #[test]
    fn dropping_the_stream_early_is_fine() {
        let opts = FlowOptions::new(1);
        let mut stream = flow(dataset(50), Split::Train, 0, &opts);
        assert!(stream.next().unwrap().is_ok());
        drop(stream);
    }
}
