//! Column names of the purchase-record schemas.
//!
//! PO and PR batches share most of their vocabulary; the few kind-specific
//! names are exposed through [`crate::rule::RecordKind`].

pub const PO_STATUS: &str = "PO狀態";
pub const PR_STATUS: &str = "PR狀態";
pub const PO_ID: &str = "PO#";
pub const PR_ID: &str = "PR#";

/// Note of the rule that labeled the row.
pub const MATCHED_NOTE: &str = "matched_condition_on_status";

pub const GL_ACCOUNT: &str = "GL#";
pub const ITEM_DESCRIPTION: &str = "Item Description";
pub const ERM: &str = "Expected Received Month_轉換格式";
/// Service period parsed out of the item description, `YYYYMM,YYYYMM`.
pub const DESCRIPTION_PERIOD: &str = "YMs of Item Description";

pub const ENTRY_QUANTITY: &str = "Entry Quantity";
pub const RECEIVED_QUANTITY: &str = "Received Quantity";
pub const BILLED_QUANTITY: &str = "Billed Quantity";
pub const ENTRY_AMOUNT: &str = "Entry Amount";
pub const ENTRY_BILLED_AMOUNT: &str = "Entry Billed Amount";
pub const ENTRY_PREPAY_AMOUNT: &str = "Entry Prepay Amount";
pub const UNIT_PRICE: &str = "Unit Price";
pub const CURRENCY: &str = "Currency";
pub const PRODUCT_CODE: &str = "Product Code";
pub const DEPARTMENT: &str = "Department";
pub const PROJECT: &str = "Project";

pub const REMARK_PROCUREMENT: &str = "Remarked by Procurement";
pub const REMARK_FN: &str = "Remarked by 上月 FN";
pub const REMARK_FN_PR: &str = "Remarked by 上月 FN PR";

// Derived accounting fields.
pub const FILE_DATE: &str = "檔案日期";
pub const ACCRUAL_FLAG: &str = "是否估計入帳";
pub const PREPAID_FLAG: &str = "是否有預付";
pub const ACCOUNT_CODE: &str = "Account code";
pub const ACCOUNT_NAME: &str = "Account Name";
pub const PRODUCT_CODE_OUT: &str = "Product code";
pub const REGION: &str = "Region_c";
pub const DEPARTMENT_OUT: &str = "Dep.";
pub const CURRENCY_OUT: &str = "Currency_c";
pub const ACCRUAL_AMOUNT: &str = "Accr. Amount";
pub const LIABILITY: &str = "Liability";
pub const PRODUCT_CODE_CHECK: &str = "PR Product Code Check";

// Closing list (auxiliary data).
pub const CLOSING_NEW_PR: &str = "new_pr_no";
pub const CLOSING_DONE_BY_FN: &str = "done_by_fn";
pub const CLOSING_PO: &str = "po_no";

// Reference data (auxiliary data).
pub const REF_ACCOUNT: &str = "Account";
pub const REF_ACCOUNT_DESC: &str = "Account Desc";
pub const REF_LIABILITY: &str = "Liability";

/// Description period value used upstream to flag an unparsable description.
pub const FORMAT_ERROR_SENTINEL: &str = "100001,100002";
