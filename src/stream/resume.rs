use std::{
    collections::VecDeque,
    fmt,
    sync::mpsc,
    thread,
    time::Instant,
};

use log::{debug, trace, warn};

use crate::{
    backoff::{Backoff, RetryBudget},
    error::{Error, Result},
    protocol::{PartialResultSet, ResultSetStats, ResultStream},
    value::Field,
};

use super::{Row, decoder::Decoder};

/// Messages without a resume token a stream buffers before giving up on resumption.
pub const MAX_BUFFERED_MESSAGES: usize = 10;

/// Issues the streaming call behind a [`RowStream`].
pub trait StreamSource: Send {
    /// Starts the call, continuing after `resume_token` when one is given.
    fn open(&mut self, resume_token: Option<&[u8]>) -> Result<ResultStream>;

    /// Moves the call to a new session after the current one was reported
    /// missing. Returns `false` when the source cannot.
    fn replace_session(&mut self) -> Result<bool> {
        Ok(false)
    }
}

/// Rows of one read or query, decoded on demand.
pub struct RowStream {
    source: Option<Box<dyn StreamSource>>,
    stream: Option<ResultStream>,
    decoder: Decoder,
    /// Completed rows not yet covered by a resume token.
    held: Vec<Row>,
    ready: VecDeque<Row>,
    failure: Option<Error>,
    resume_token: Option<Vec<u8>>,
    since_token: usize,
    resumable: bool,
    delivered: usize,
    stats: Option<ResultSetStats>,
    deadline: Option<Instant>,
    retry: RetryBudget,
}

impl RowStream {
    pub fn new(source: Box<dyn StreamSource>, deadline: Option<Instant>) -> Self {
        Self::with_backoff(source, deadline, Backoff::default())
    }

    pub fn with_backoff(
        source: Box<dyn StreamSource>,
        deadline: Option<Instant>,
        backoff: Backoff,
    ) -> Self {
        Self {
            source: Some(source),
            stream: None,
            decoder: Decoder::new(),
            held: Vec::new(),
            ready: VecDeque::new(),
            failure: None,
            resume_token: None,
            since_token: 0,
            resumable: true,
            delivered: 0,
            stats: None,
            deadline,
            retry: RetryBudget::new(backoff, deadline),
        }
    }

    /// Columns of the result, known once the first message has arrived.
    pub fn metadata(&self) -> Option<&[Field]> {
        self.decoder.fields().map(|fields| &fields[..])
    }

    /// Statistics sent with the final message.
    pub fn stats(&self) -> Option<&ResultSetStats> {
        self.stats.as_ref()
    }

    /// Moves the stream onto a producer thread feeding a channel of `capacity`
    /// rows. The producer blocks while the channel is full and stops when the
    /// receiver is dropped.
    pub fn into_channel(self, capacity: usize) -> mpsc::Receiver<Result<Row>> {
        let (sender, receiver) = mpsc::sync_channel(capacity);
        thread::spawn(move || {
            for row in self {
                if sender.send(row).is_err() {
                    debug!("row receiver dropped; stopping producer");
                    break;
                }
            }
        });
        receiver
    }

    fn pull(&mut self) -> Result<()> {
        let Some(source) = self.source.as_mut() else {
            return Ok(());
        };
        let next = match self.stream.as_mut() {
            Some(stream) => stream.next(),
            None => {
                return match source.open(self.resume_token.as_deref()) {
                    Ok(stream) => {
                        self.stream = Some(stream);
                        Ok(())
                    }
                    Err(err) => self.recover(err),
                };
            }
        };

        match next {
            Some(Ok(message)) => self.accept(message),
            Some(Err(status)) => self.recover(status.into()),
            None => self.finish(),
        }
    }

    fn accept(&mut self, message: PartialResultSet) -> Result<()> {
        let token = message.resume_token.clone();
        let last = message.last;
        if let Some(stats) = &message.stats {
            self.stats = Some(stats.clone());
        }

        let rows = self.decoder.push(message)?;
        self.held.extend(rows);

        match token {
            Some(token) => {
                trace!("resume token received; releasing {} row(s)", self.held.len());
                self.decoder.checkpoint();
                self.resume_token = Some(token);
                self.since_token = 0;
                self.resumable = true;
                self.ready.extend(self.held.drain(..));
            }
            None => {
                self.since_token += 1;
                if self.resumable && self.since_token > MAX_BUFFERED_MESSAGES {
                    warn!(
                        "{} messages without a resume token; stream is no longer resumable",
                        self.since_token
                    );
                    self.resumable = false;
                }
                if !self.resumable {
                    self.ready.extend(self.held.drain(..));
                }
            }
        }

        if last {
            return self.finish();
        }
        Ok(())
    }

    fn recover(&mut self, err: Error) -> Result<()> {
        self.stream = None;

        if err.is_transient() {
            if !self.resumable {
                warn!("stream failed past the buffering limit: {err}");
                return Err(err);
            }
            self.retry.pause(err)?;
            self.decoder.restore();
            self.held.clear();
            self.since_token = 0;
            debug!(
                "resuming stream {}",
                if self.resume_token.is_some() {
                    "from the last resume token"
                } else {
                    "from the start"
                }
            );
            return Ok(());
        }

        if err.is_session_not_found() && self.delivered == 0 {
            if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Err(Error::DeadlineExceeded {
                    attempts: self.retry.retries() + 1,
                    last: Some(Box::new(err)),
                });
            }
            if let Some(source) = self.source.as_mut() {
                if source.replace_session()? {
                    debug!("restarting stream on a replacement session");
                    self.restart();
                    return Ok(());
                }
            }
        }

        Err(err)
    }

    fn restart(&mut self) {
        self.decoder = Decoder::new();
        self.held.clear();
        self.ready.clear();
        self.resume_token = None;
        self.since_token = 0;
        self.resumable = true;
        self.stats = None;
    }

    fn finish(&mut self) -> Result<()> {
        self.decoder.finish()?;
        self.ready.extend(self.held.drain(..));
        self.close();
        Ok(())
    }

    /// Drops the call and the source, returning its session.
    fn close(&mut self) {
        self.stream = None;
        self.source = None;
    }
}

impl Iterator for RowStream {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(row) = self.ready.pop_front() {
                self.delivered += 1;
                return Some(Ok(row));
            }
            if let Some(err) = self.failure.take() {
                return Some(Err(err));
            }
            self.source.as_ref()?;

            if let Err(err) = self.pull() {
                self.held.clear();
                self.close();
                self.failure = Some(err);
            }
        }
    }
}

impl fmt::Debug for RowStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowStream")
            .field("open", &self.source.is_some())
            .field("ready", &self.ready.len())
            .field("held", &self.held.len())
            .field("resumable", &self.resumable)
            .field("delivered", &self.delivered)
            .finish_non_exhaustive()
    }
}
