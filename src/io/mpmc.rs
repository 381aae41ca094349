use crate::error::{RecvError, SendError, SendFailReason, TryRecvError};
use crate::utils::CancelToken;
use crossbeam::channel as cbchan;
use std::time::{Duration, Instant};

/// Cancellation is re-checked at least this often while blocked.
const CANCEL_SLICE: Duration = Duration::from_millis(5);

pub struct MpmcChannel;

impl MpmcChannel {
    #[inline]
    pub fn bounded<T: Send + 'static>(capacity: usize) -> (MpmcSender<T>, MpmcReceiver<T>) {
        let (tx, rx) = cbchan::bounded::<T>(capacity);
        (MpmcSender { tx }, MpmcReceiver { rx })
    }

    #[inline]
    pub fn unbounded<T: Send + 'static>() -> (MpmcSender<T>, MpmcReceiver<T>) {
        let (tx, rx) = cbchan::unbounded::<T>();
        (MpmcSender { tx }, MpmcReceiver { rx })
    }
}

fn deadline_slice(start: Instant, timeout: Option<Duration>) -> Option<Duration> {
    match timeout {
        None => Some(CANCEL_SLICE),
        Some(t) => {
            let left = t.checked_sub(start.elapsed())?;
            if left.is_zero() {
                None
            } else {
                Some(left.min(CANCEL_SLICE))
            }
        }
    }
}

#[derive(Clone)]
pub struct MpmcSender<E> {
    tx: cbchan::Sender<E>,
}

impl<E: Send + 'static> MpmcSender<E> {
    /// Fails with `Full` or `Closed`, handing the value back.
    #[inline]
    pub fn try_send(&self, a: E) -> Result<(), SendError<E>> {
        self.tx.try_send(a).map_err(|e| match e {
            cbchan::TrySendError::Full(v) => SendError::new(SendFailReason::Full, Some(v)),
            cbchan::TrySendError::Disconnected(v) => {
                SendError::new(SendFailReason::Closed, Some(v))
            }
        })
    }

    /// Blocks until there is room, the timeout elapses or `cancel` fires.
    pub fn send(
        &self,
        mut a: E,
        cancel: &CancelToken,
        timeout: Option<Duration>,
    ) -> Result<(), SendError<E>> {
        let start = Instant::now();
        loop {
            if cancel.is_cancelled() {
                return Err(SendError::new(SendFailReason::Cancelled, Some(a)));
            }
            let Some(slice) = deadline_slice(start, timeout) else {
                return Err(SendError::new(SendFailReason::Timeout, Some(a)));
            };
            match self.tx.send_timeout(a, slice) {
                Ok(()) => return Ok(()),
                Err(cbchan::SendTimeoutError::Timeout(v)) => a = v,
                Err(cbchan::SendTimeoutError::Disconnected(v)) => {
                    return Err(SendError::new(SendFailReason::Closed, Some(v)));
                }
            }
        }
    }
}

pub struct MpmcReceiver<E> {
    rx: cbchan::Receiver<E>,
}

impl<E> Clone for MpmcReceiver<E> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
        }
    }
}

impl<E: Send + 'static> MpmcReceiver<E> {
    #[inline]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    #[inline]
    pub fn try_recv(&self) -> Result<E, TryRecvError> {
        self.rx.try_recv().map_err(|e| match e {
            cbchan::TryRecvError::Empty => TryRecvError::Empty,
            cbchan::TryRecvError::Disconnected => TryRecvError::Disconnected,
        })
    }

    /// Blocks for the next value; `timeout: None` waits until cancelled or
    /// every sender is gone.
    pub fn recv(&self, cancel: &CancelToken, timeout: Option<Duration>) -> Result<E, RecvError> {
        let start = Instant::now();
        loop {
            if cancel.is_cancelled() {
                return Err(RecvError::Cancelled);
            }
            let Some(slice) = deadline_slice(start, timeout) else {
                return Err(RecvError::Timeout);
            };
            match self.rx.recv_timeout(slice) {
                Ok(v) => return Ok(v),
                Err(cbchan::RecvTimeoutError::Timeout) => continue,
                Err(cbchan::RecvTimeoutError::Disconnected) => {
                    return Err(RecvError::Disconnected);
                }
            }
        }
    }

    /// Up to `max` values that are already queued.
    pub fn drain(&self, max: usize) -> Vec<E> {
        self.rx.try_iter().take(max).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn bounded_channel_reports_full_and_closed() {
        let (tx, rx) = MpmcChannel::bounded::<u32>(1);
        tx.try_send(1).unwrap();
        let err = tx.try_send(2).unwrap_err();
        assert_eq!(err.reason, SendFailReason::Full);
        assert_eq!(err.value, Some(2));

        drop(rx);
        assert_eq!(tx.try_send(3).unwrap_err().reason, SendFailReason::Closed);
    }

    #[test]
    fn recv_honours_timeout_and_cancellation() {
        let (_tx, rx) = MpmcChannel::unbounded::<u32>();
        let cancel = CancelToken::new_root();
        let start = Instant::now();
        assert_eq!(
            rx.recv(&cancel, Some(Duration::from_millis(15))),
            Err(RecvError::Timeout)
        );
        assert!(start.elapsed() >= Duration::from_millis(15));

        let canceller = {
            let cancel = cancel.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                cancel.cancel();
            })
        };
        assert_eq!(rx.recv(&cancel, None), Err(RecvError::Cancelled));
        canceller.join().unwrap();
    }

    #[test]
    fn drain_takes_only_what_is_queued() {
        let (tx, rx) = MpmcChannel::unbounded::<u32>();
        for i in 0..5 {
            tx.try_send(i).unwrap();
        }
        assert_eq!(rx.drain(3), vec![0, 1, 2]);
        assert_eq!(rx.len(), 2);
        assert_eq!(rx.drain(10), vec![3, 4]);
        assert!(rx.is_empty());
    }
}
