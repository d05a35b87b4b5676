//! Typed ID definitions.

use crate::define_id;

// =============================================================================
// Tenancy
// =============================================================================

define_id!(OrgId, "org");

// =============================================================================
// Fleet
// =============================================================================

define_id!(NodeId, "node");
define_id!(TaskId, "task");

// =============================================================================
// Workloads
// =============================================================================

define_id!(AppId, "app");
define_id!(DatabaseId, "db");
define_id!(PlanId, "plan");
define_id!(RuntimeId, "rt");
define_id!(BuildId, "bld");

// =============================================================================
// Billing
// =============================================================================

define_id!(LedgerEntryId, "led");

// =============================================================================
// Backups
// =============================================================================

define_id!(BackupPolicyId, "bkp");
define_id!(BackupId, "bak");

// =============================================================================
// Requests
// =============================================================================

define_id!(RequestId, "req");
