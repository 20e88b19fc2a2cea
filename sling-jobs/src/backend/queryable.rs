use crate::job::Job;

use super::Query;

pub(super) trait Queryable {
    fn matches(&self, job: &Job) -> bool;
}

impl Queryable for Query {
    fn matches(&self, job: &Job) -> bool {
        match self {
            Query::Not(inner) => !inner.matches(job),
            Query::And(inner) => inner.iter().all(|query| query.matches(job)),
            Query::Or(inner) => inner.iter().any(|query| query.matches(job)),
            Query::IdEquals(id) => job.id == *id,
            Query::TopicEquals(topic) => &job.topic == topic,
            Query::QueueEquals(queue_name) => &job.queue_name == queue_name,
            Query::StateEqual(state) => job.state == *state,
            Query::PropertyEquals(key, value) => job.properties.get(key) == Some(value),
        }
    }
}
