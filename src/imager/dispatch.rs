// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Distributing visibility batches over workers.
//!
//! A [`Dispatcher`] pulls every batch out of a [`VisSource`] and hands it to a
//! job along with an accumulator. Each worker owns its accumulator outright;
//! the accumulators are combined with a reduction once the source is
//! exhausted, so nothing shared is ever written to concurrently.

use std::any::Any;
use std::num::NonZeroUsize;
use std::thread;

use crossbeam_channel::{bounded, Receiver, Sender};
use crossbeam_utils::atomic::AtomicCell;
use log::{debug, trace};

use super::ImagingError;
use crate::{
    constants::DEFAULT_QUEUE_DEPTH,
    vis::{VisBatch, VisSource, VisSourceError},
};

pub trait Dispatcher {
    /// Rewind `source` and run `job` on every batch it yields, together with
    /// the batch's position in the source. Accumulators are made with `init`;
    /// if more than one is made, they are folded together with `reduce`.
    ///
    /// # Errors
    ///
    /// The first error from the source, `init`, `job` or `reduce` stops the
    /// pass and is returned; partial accumulators are discarded.
    fn map_reduce<A, I, J, R>(
        &self,
        source: &mut dyn VisSource,
        init: I,
        job: J,
        reduce: R,
    ) -> Result<A, ImagingError>
    where
        A: Send,
        I: Fn() -> Result<A, ImagingError> + Sync,
        J: Fn(&mut A, usize, VisBatch) -> Result<(), ImagingError> + Sync,
        R: FnMut(&mut A, A) -> Result<(), ImagingError>;
}

/// Run every job on the calling thread, in source order, with a single
/// accumulator.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialDispatcher;

impl Dispatcher for SerialDispatcher {
    fn map_reduce<A, I, J, R>(
        &self,
        source: &mut dyn VisSource,
        init: I,
        job: J,
        _reduce: R,
    ) -> Result<A, ImagingError>
    where
        A: Send,
        I: Fn() -> Result<A, ImagingError> + Sync,
        J: Fn(&mut A, usize, VisBatch) -> Result<(), ImagingError> + Sync,
        R: FnMut(&mut A, A) -> Result<(), ImagingError>,
    {
        source.reset()?;
        let mut acc = init()?;
        let mut i_batch = 0;
        while let Some(batch) = source.next_batch()? {
            job(&mut acc, i_batch, batch)?;
            i_batch += 1;
        }
        trace!("Serial dispatcher processed {i_batch} batches");
        Ok(acc)
    }
}

/// Read batches on the calling thread and send them through a bounded queue
/// to a pool of worker threads, each with its own accumulator.
#[derive(Debug, Clone, Copy)]
pub struct ThreadedDispatcher {
    num_workers: usize,
    queue_depth: usize,
}

impl ThreadedDispatcher {
    /// At least one worker is always used.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers: num_workers.max(1),
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }

    /// Set how many batches may be waiting for a worker before reading
    /// blocks. At least one.
    pub fn with_queue_depth(mut self, queue_depth: usize) -> Self {
        self.queue_depth = queue_depth.max(1);
        self
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_depth
    }
}

impl Default for ThreadedDispatcher {
    /// One worker per available core.
    fn default() -> Self {
        Self::new(
            thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1),
        )
    }
}

impl Dispatcher for ThreadedDispatcher {
    fn map_reduce<A, I, J, R>(
        &self,
        source: &mut dyn VisSource,
        init: I,
        job: J,
        mut reduce: R,
    ) -> Result<A, ImagingError>
    where
        A: Send,
        I: Fn() -> Result<A, ImagingError> + Sync,
        J: Fn(&mut A, usize, VisBatch) -> Result<(), ImagingError> + Sync,
        R: FnMut(&mut A, A) -> Result<(), ImagingError>,
    {
        source.reset()?;

        let (tx, rx) = bounded(self.queue_depth);
        // Use a variable to track whether any threads have an issue.
        let error = AtomicCell::new(false);
        let (init, job, error_ref) = (&init, &job, &error);

        let (read_result, worker_results) = thread::scope(|scope| {
            let handles = (0..self.num_workers)
                .map(|i_worker| {
                    let rx = rx.clone();
                    scope.spawn(move || {
                        let _guard = AbortOnPanic(error_ref);
                        let result = work(i_worker, rx, init, job, error_ref);
                        // Let the other threads abandon their work early.
                        if result.is_err() {
                            error_ref.store(true);
                        }
                        result
                    })
                })
                .collect::<Vec<_>>();
            // The workers hold the only receivers now, so if they all exit,
            // sending fails and reading stops.
            drop(rx);

            let read_result = feed(source, tx, error_ref);
            if read_result.is_err() {
                error_ref.store(true);
            }

            let worker_results = handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .map_err(|e| ImagingError::Worker(panic_message(e)))
                        .and_then(|r| r)
                })
                .collect::<Vec<_>>();
            (read_result, worker_results)
        });

        read_result?;
        let mut accs = worker_results.into_iter();
        let mut total = match accs.next() {
            Some(acc) => acc?,
            None => init()?,
        };
        for acc in accs {
            reduce(&mut total, acc?)?;
        }
        Ok(total)
    }
}

/// Raises the abort flag if the worker holding it panics, so that the reader
/// and the other workers stop early.
struct AbortOnPanic<'a>(&'a AtomicCell<bool>);

impl Drop for AbortOnPanic<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.store(true);
        }
    }
}

/// Send every batch from `source` to the workers. `tx` is dropped on return,
/// which tells the workers there is nothing more coming.
fn feed(
    source: &mut dyn VisSource,
    tx: Sender<(usize, VisBatch)>,
    error: &AtomicCell<bool>,
) -> Result<(), VisSourceError> {
    let mut i_batch = 0;
    while let Some(batch) = source.next_batch()? {
        // Should we continue?
        if error.load() {
            debug!("Stopping reading after {i_batch} batches; a worker failed");
            return Ok(());
        }
        match tx.send((i_batch, batch)) {
            Ok(()) => (),
            // Every worker has hung up, which only happens on error.
            Err(_) => return Ok(()),
        }
        i_batch += 1;
    }
    trace!("Finished reading {i_batch} batches");
    Ok(())
}

fn work<A, I, J>(
    i_worker: usize,
    rx: Receiver<(usize, VisBatch)>,
    init: &I,
    job: &J,
    error: &AtomicCell<bool>,
) -> Result<A, ImagingError>
where
    I: Fn() -> Result<A, ImagingError>,
    J: Fn(&mut A, usize, VisBatch) -> Result<(), ImagingError>,
{
    let mut acc = init()?;
    let mut num_batches = 0;
    for (i_batch, batch) in rx.iter() {
        if error.load() {
            break;
        }
        job(&mut acc, i_batch, batch)?;
        num_batches += 1;
    }
    trace!("Worker {i_worker} processed {num_batches} batches");
    Ok(acc)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{vis::InMemoryVisSource, UVW};
    use std::time::Duration;

    fn source(num_batches: usize) -> InMemoryVisSource {
        InMemoryVisSource::new(
            (0..num_batches)
                .map(|i| VisBatch::new(vec![UVW::new(i as f64, 0.0, 0.0); i + 1], vec![1e8], 1))
                .collect(),
        )
    }

    /// Sum the row counts and collect the batch indices.
    fn count_rows<D: Dispatcher>(
        dispatcher: &D,
        source: &mut dyn VisSource,
    ) -> Result<(usize, Vec<usize>), ImagingError> {
        dispatcher.map_reduce(
            source,
            || Ok((0, vec![])),
            |acc, i, batch| {
                acc.0 += batch.num_rows();
                acc.1.push(i);
                Ok(())
            },
            |total, (rows, indices)| {
                total.0 += rows;
                total.1.extend(indices);
                Ok(())
            },
        )
    }

    #[test]
    fn test_serial_sees_every_batch_in_order() {
        let mut source = source(5);
        let (rows, indices) = count_rows(&SerialDispatcher, &mut source).unwrap();
        assert_eq!(rows, 1 + 2 + 3 + 4 + 5);
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_threaded_sees_every_batch_once() {
        for num_workers in [1, 2, 3, 8] {
            let dispatcher = ThreadedDispatcher::new(num_workers).with_queue_depth(2);
            let mut source = source(20);
            let (rows, mut indices) = count_rows(&dispatcher, &mut source).unwrap();
            assert_eq!(rows, (1..=20).sum::<usize>());
            indices.sort_unstable();
            assert_eq!(indices, (0..20).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_source_is_rewound() {
        let mut source = source(3);
        source.next_batch().unwrap();
        let (rows, _) = count_rows(&ThreadedDispatcher::new(2), &mut source).unwrap();
        assert_eq!(rows, 6);
        let (rows, _) = count_rows(&SerialDispatcher, &mut source).unwrap();
        assert_eq!(rows, 6);
    }

    #[test]
    fn test_empty_source() {
        let mut source = source(0);
        let (rows, indices) = count_rows(&ThreadedDispatcher::new(4), &mut source).unwrap();
        assert_eq!(rows, 0);
        assert!(indices.is_empty());
    }

    fn job_errors_are_returned<D: Dispatcher>(dispatcher: &D) {
        let mut source = source(10);
        let result = dispatcher.map_reduce(
            &mut source,
            || Ok(()),
            |_, i, _| {
                if i == 3 {
                    Err(ImagingError::Transform("bad batch".to_string()))
                } else {
                    Ok(())
                }
            },
            |_, _| Ok(()),
        );
        assert!(matches!(result, Err(ImagingError::Transform(_))));
    }

    #[test]
    fn test_job_errors_are_returned() {
        job_errors_are_returned(&SerialDispatcher);
        job_errors_are_returned(&ThreadedDispatcher::new(3));
    }

    #[test]
    fn test_worker_panics_are_errors() {
        let mut source = source(4);
        let result = ThreadedDispatcher::new(2).map_reduce(
            &mut source,
            || Ok(()),
            |_, i, _| {
                if i == 1 {
                    panic!("worker fell over");
                }
                Ok(())
            },
            |_, _| Ok(()),
        );
        match result {
            Err(ImagingError::Worker(msg)) => assert_eq!(msg, "worker fell over"),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn test_worker_panic_stops_the_pass() {
        let num_batches = 200;
        let mut source = InMemoryVisSource::new(
            (0..num_batches)
                .map(|_| VisBatch::new(vec![UVW::default()], vec![1e8], 1))
                .collect(),
        );
        let processed = AtomicCell::new(0_usize);
        let result = ThreadedDispatcher::new(2).with_queue_depth(1).map_reduce(
            &mut source,
            || Ok(()),
            |_, i, _| {
                if i == 0 {
                    panic!("worker fell over");
                }
                thread::sleep(Duration::from_millis(2));
                processed.fetch_add(1);
                Ok(())
            },
            |_, _| Ok(()),
        );
        assert!(matches!(result, Err(ImagingError::Worker(_))));
        // The surviving worker gives up once it notices the panic, long
        // before it could get through everything.
        let processed = processed.load();
        assert!(
            processed < (num_batches - 1) / 2,
            "{processed} batches were processed after the panic"
        );
    }

    struct FailingSource;

    impl VisSource for FailingSource {
        fn reset(&mut self) -> Result<(), VisSourceError> {
            Ok(())
        }

        fn next_batch(&mut self) -> Result<Option<VisBatch>, VisSourceError> {
            Err(VisSourceError::Read {
                batch: 0,
                message: "disk on fire".to_string(),
            })
        }
    }

    fn source_errors_are_returned<D: Dispatcher>(dispatcher: &D) {
        let result = dispatcher.map_reduce(
            &mut FailingSource,
            || Ok(()),
            |_, _, _| Ok(()),
            |_, _| Ok(()),
        );
        assert!(matches!(
            result,
            Err(ImagingError::VisSource(VisSourceError::Read { .. }))
        ));
    }

    #[test]
    fn test_source_errors_are_returned() {
        source_errors_are_returned(&SerialDispatcher);
        source_errors_are_returned(&ThreadedDispatcher::new(3));
    }
}
