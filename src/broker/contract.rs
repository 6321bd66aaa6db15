// =============================================================================
// Contract id parsing
// =============================================================================

/// Extract the root symbol from a gateway contract id: the fourth dot-
/// separated field (`"CON.F.US.MNQ.U25"` yields `"MNQ"`).
pub fn root_symbol(contract_id: &str) -> Option<&str> {
    let field = contract_id.split('.').nth(3)?;
    if field.is_empty() {
        None
    } else {
        Some(field)
    }
}
