//! Translation of a job and its policy into bucket requests.

use crate::policy::Policy;
use crate::store::RateLimitReq;

use super::job::Job;

/// Bucket key of the global throughput cap.
pub const GLOBAL_KEY: &str = "global";

/// Bucket key of a tenant's quota.
pub fn tenant_key(tenant_id: &str) -> String {
    format!("tenant:{tenant_id}")
}

/// Bucket key of a dependency's rate limit.
pub fn dependency_key(name: &str) -> String {
    format!("dependency:{name}")
}

/// Build the full request set for one job.
///
/// One global request, one tenant request and one request per declared
/// dependency that has a configured rate limit. Dimensions configured with a
/// zero capacity are disabled and contribute nothing.
pub fn build_requests(job: &Job, policy: &Policy) -> Vec<RateLimitReq> {
    let global = &policy.global_execution_limit;
    let mut reqs = Vec::with_capacity(2 + job.dependencies.len());

    if global.max_jobs > 0 {
        reqs.push(
            RateLimitReq::new(
                GLOBAL_KEY,
                global.max_jobs as u64,
                global.refill_rate(global.max_jobs),
                1,
            )
            .with_min_interval(global.min_interval()),
        );
    }

    if global.max_concurrent_per_tenant > 0 {
        reqs.push(RateLimitReq::new(
            tenant_key(&job.tenant_id),
            global.max_concurrent_per_tenant as u64,
            global.refill_rate(global.max_concurrent_per_tenant),
            1,
        ));
    }

    let mut names: Vec<&String> = job.dependencies.keys().collect();
    names.sort();
    for name in names {
        let Some(dep) = policy.dependencies.get(name) else {
            continue;
        };
        let Some(limit) = dep.rate_limit.filter(|l| l.max_requests > 0) else {
            continue;
        };
        reqs.push(
            RateLimitReq::new(
                dependency_key(name),
                limit.max_requests as u64,
                limit.refill_rate(),
                job.dependencies[name],
            )
            .with_min_interval(dep.min_interval())
            .with_warmup(dep.warmup()),
        );
    }

    reqs
}
