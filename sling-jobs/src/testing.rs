//! Helpers for testing.

/// A macro for making assertions about what jobs have been added to a backend.
///
/// Assertions can be based on topic, queue, state and properties. Without a count exactly one
/// matching job is expected.
///
/// # Example
///
/// ```
/// # use sling_jobs::prelude::*;
/// # use sling_jobs::testing::assert_enqueued;
/// # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
/// use sling_jobs::backend::memory::InMemoryBackend;
/// let backend = InMemoryBackend::new().paused();
/// let manager = JobManager::new(backend.clone(), JobsConfig::default()).unwrap();
///
/// manager
///     .create_job("org/apache/sling/event/mail")
///     .property("to", "admin@example.com")
///     .unwrap()
///     .add()
///     .await
///     .unwrap();
///
/// manager
///     .create_job("org/apache/sling/event/mail")
///     .property("to", "author@example.com")
///     .unwrap()
///     .add()
///     .await
///     .unwrap();
///
/// assert_enqueued!(
///     to: backend,
///     with_topic: "org/apache/sling/event/mail",
///     with_property: ("to", "admin@example.com")
/// );
///
/// assert_enqueued!(
///     2 jobs,
///     to: backend,
///     in_queue: "main",
///     in_state: JobState::Queued,
/// );
/// # });
/// ```
#[macro_export]
macro_rules! assert_enqueued {
    (1 job, to: $backend:ident, $($tail:tt)*) => {
        $crate::assert_enqueued!(@internal 1 to: $backend, $($tail)*);
    };
    ($n:literal jobs, to: $backend:ident, $($tail:tt)*) => {
        $crate::assert_enqueued!(@internal $n to: $backend, $($tail)*);
    };
    (to: $backend:ident, $($tail:tt)*) => {
        $crate::assert_enqueued!(@internal 1 to: $backend, $($tail)*);
    };
    (@internal $n:literal to: $backend:ident, $($tail:tt)*) => {{
        use $crate::backend::Query;
        use $crate::backend::Backend;
        let queries: ::std::vec::Vec<Query> = $crate::assert_enqueued!(@query []; $($tail)*);
        let jobs = $backend.query(Query::And(queries)).await.unwrap();
        let all_jobs = $backend.query(Query::all()).await.unwrap();
        assert!(
            jobs.len() == $n,
            "Unexpected number of jobs enqueued {},\n\n\
            Expected {} jobs, found {} matching job enqueued:\n\n\
            Matching jobs:\n\
            {jobs:#?}\n\n\
            All enqueued jobs:\n\
            {all_jobs:#?}",
            stringify!($($tail)*),
            $n,
            jobs.len(),
        );
    }};
    (@query [$($acc:expr),*];) => {
        ::std::vec![$($acc),*]
    };
    (@query [$($acc:expr),*]; with_topic: $topic:expr $(, $($tail:tt)*)?) => {
        $crate::assert_enqueued!(
            @query [$($acc,)* $crate::backend::Query::TopicEquals(::std::string::ToString::to_string(&$topic))];
            $($($tail)*)?
        )
    };
    (@query [$($acc:expr),*]; in_queue: $queue:expr $(, $($tail:tt)*)?) => {
        $crate::assert_enqueued!(
            @query [$($acc,)* $crate::backend::Query::QueueEquals(::std::string::ToString::to_string(&$queue))];
            $($($tail)*)?
        )
    };
    (@query [$($acc:expr),*]; in_state: $state:expr $(, $($tail:tt)*)?) => {
        $crate::assert_enqueued!(
            @query [$($acc,)* $crate::backend::Query::StateEqual($state)];
            $($($tail)*)?
        )
    };
    (@query [$($acc:expr),*]; with_property: ($key:expr, $value:expr) $(, $($tail:tt)*)?) => {
        $crate::assert_enqueued!(
            @query [$($acc,)* $crate::backend::Query::PropertyEquals(
                ::std::string::ToString::to_string(&$key),
                serde_json::to_value($value).unwrap(),
            )];
            $($($tail)*)?
        )
    };
}

pub use assert_enqueued;
