//! Ordered concatenation of lazily opened streams.
//!
//! At most one inner stream exists at a time: the next one is opened only
//! after the current one has ended, and the current one is dropped before
//! that happens.

use std::future::Future;

use futures::StreamExt;
use futures::stream::{self, BoxStream};

type Inner<T, E> = BoxStream<'static, Result<T, E>>;

enum Phase<S, T, E> {
    Opening(S),
    Streaming(S, Inner<T, E>),
    Done,
}

/// Concatenate the streams produced by repeatedly calling `open_next`.
///
/// `open_next` receives the current state and returns the next state with a
/// stream to drain, or `None` when there is nothing left. The first error,
/// whether from `open_next` or from an inner stream, is forwarded and ends
/// the output.
pub fn join_ordered<S, T, E, F, Fut>(state: S, open_next: F) -> Inner<T, E>
where
    S: Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
    F: FnMut(S) -> Fut + Send + 'static,
    Fut: Future<Output = Result<Option<(S, Inner<T, E>)>, E>> + Send + 'static,
{
    stream::unfold(
        (Phase::Opening(state), open_next),
        |(mut phase, mut open_next)| async move {
            loop {
                phase = match phase {
                    Phase::Opening(state) => match open_next(state).await {
                        Ok(Some((next, inner))) => Phase::Streaming(next, inner),
                        Ok(None) => return None,
                        Err(e) => return Some((Err(e), (Phase::Done, open_next))),
                    },
                    Phase::Streaming(state, mut inner) => match inner.next().await {
                        Some(Ok(item)) => {
                            return Some((Ok(item), (Phase::Streaming(state, inner), open_next)));
                        }
                        Some(Err(e)) => return Some((Err(e), (Phase::Done, open_next))),
                        None => Phase::Opening(state),
                    },
                    Phase::Done => return None,
                };
            }
        },
    )
    .boxed()
}

/// Open each item in turn with `open` and concatenate the results.
pub fn join_each<I, T, E, F, Fut>(items: I, mut open: F) -> Inner<T, E>
where
    I: IntoIterator,
    I::IntoIter: Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
    F: FnMut(I::Item) -> Fut + Send + 'static,
    Fut: Future<Output = Result<Inner<T, E>, E>> + Send + 'static,
{
    join_ordered(items.into_iter(), move |mut remaining| {
        let opening = remaining.next().map(&mut open);
        async move {
            match opening {
                Some(opening) => Ok(Some((remaining, opening.await?))),
                None => Ok(None),
            }
        }
    })
}
