//! Whole-hour metering.
//!
//! A resource is charged for every full hour between its billing cursor and
//! `now`. Partial hours are never charged and never accumulate: they stay
//! behind the cursor until they complete.

use chrono::{DateTime, TimeDelta, Utc};
use rust_decimal::Decimal;

use crate::store::{BillableResource, Charge, ResourceRef};

/// Full hours elapsed since `cursor`. Zero if `now` is not past it.
pub fn whole_hours(cursor: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (now - cursor).num_hours().max(0)
}

/// Rate and instance count a resource is billed at.
///
/// Databases without a plan bill at `default_database_rate` as one instance.
pub fn rate_and_instances(
    resource: &BillableResource,
    default_database_rate: Decimal,
) -> (Decimal, i32) {
    match (resource.resource, resource.hourly_rate) {
        (_, Some(rate)) => (rate, resource.instances.max(1)),
        (ResourceRef::Database(_), None) => (default_database_rate, 1),
        (ResourceRef::Application(_), None) => (Decimal::ZERO, resource.instances.max(1)),
    }
}

/// The charge owed at `now`, or `None` if less than an hour has elapsed.
pub fn compute_charge(
    resource: &BillableResource,
    default_database_rate: Decimal,
    now: DateTime<Utc>,
) -> Option<Charge> {
    let hours = whole_hours(resource.billing_cursor, now);
    if hours < 1 {
        return None;
    }

    let (hourly_rate, instances) = rate_and_instances(resource, default_database_rate);
    let amount = hourly_rate * Decimal::from(instances) * Decimal::from(hours);

    Some(Charge {
        resource: resource.resource,
        org_id: resource.org_id,
        plan_id: resource.plan_id,
        instances,
        hourly_rate,
        hours,
        amount,
        period_start: resource.billing_cursor,
        period_end: resource.billing_cursor + TimeDelta::hours(hours),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use fleet_events::ResourceStatus;
    use fleet_id::{AppId, DatabaseId, OrgId, PlanId};
    use rstest::rstest;
    use rust_decimal_macros::dec;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn app(rate: Decimal, instances: i32, cursor: DateTime<Utc>) -> BillableResource {
        BillableResource {
            resource: ResourceRef::Application(AppId::new()),
            org_id: OrgId::new(),
            plan_id: Some(PlanId::new()),
            hourly_rate: Some(rate),
            instances,
            status: ResourceStatus::Running,
            node_id: None,
            billing_cursor: cursor,
        }
    }

    #[rstest]
    #[case(0, 0)]
    #[case(59, 0)]
    #[case(60, 1)]
    #[case(65, 1)]
    #[case(119, 1)]
    #[case(130, 2)]
    #[case(-30, 0)]
    fn test_whole_hours(#[case] minutes: i64, #[case] expected: i64) {
        assert_eq!(whole_hours(t0(), t0() + TimeDelta::minutes(minutes)), expected);
    }

    #[test]
    fn test_charge_at_65_minutes() {
        let resource = app(dec!(0.01), 1, t0());
        let charge = compute_charge(&resource, dec!(0.005), t0() + TimeDelta::minutes(65)).unwrap();

        assert_eq!(charge.hours, 1);
        assert_eq!(charge.amount, dec!(0.01));
        assert_eq!(charge.period_start, t0());
        assert_eq!(charge.period_end, t0() + TimeDelta::minutes(60));
    }

    #[test]
    fn test_no_charge_under_an_hour() {
        let resource = app(dec!(0.01), 1, t0() + TimeDelta::minutes(60));
        assert!(compute_charge(&resource, dec!(0.005), t0() + TimeDelta::minutes(70)).is_none());
    }

    #[test]
    fn test_amount_scales_with_instances_and_hours() {
        let resource = app(dec!(0.02), 3, t0());
        let charge = compute_charge(&resource, dec!(0.005), t0() + TimeDelta::minutes(185)).unwrap();
        assert_eq!(charge.hours, 3);
        assert_eq!(charge.amount, dec!(0.18));
    }

    #[test]
    fn test_planless_database_uses_default_rate() {
        let resource = BillableResource {
            resource: ResourceRef::Database(DatabaseId::new()),
            org_id: OrgId::new(),
            plan_id: None,
            hourly_rate: None,
            instances: 4,
            status: ResourceStatus::Running,
            node_id: None,
            billing_cursor: t0(),
        };
        let charge = compute_charge(&resource, dec!(0.005), t0() + TimeDelta::hours(2)).unwrap();
        assert_eq!(charge.instances, 1);
        assert_eq!(charge.amount, dec!(0.010));
    }
}
