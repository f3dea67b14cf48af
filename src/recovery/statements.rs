/// SQL text for the data rows of one log table.
#[derive(Debug, Clone)]
pub struct LogStatements {
    table: String,
}

impl LogStatements {
    pub fn new(table: impl Into<String>) -> Self {
        Self { table: table.into() }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Every row of one server's service, the control row included.
    pub fn select_rows(&self) -> String {
        format!(
            "SELECT RU_ID, RUSECTION_ID, RUSECTION_DATA_INDEX, DATA FROM {} WHERE SERVER_NAME = ? AND SERVICE_ID = ?",
            self.table
        )
    }

    pub fn insert_row(&self) -> String {
        format!(
            "INSERT INTO {} (SERVER_NAME, SERVICE_ID, RU_ID, RUSECTION_ID, RUSECTION_DATA_INDEX, DATA) \
             VALUES (?, ?, ?, ?, ?, ?)",
            self.table
        )
    }

    /// Overwrites the single-data item of a section.
    pub fn update_single_data(&self) -> String {
        format!(
            "UPDATE {} SET DATA = ? WHERE SERVER_NAME = ? AND SERVICE_ID = ? AND RU_ID = ? AND RUSECTION_ID = ? \
             AND RUSECTION_DATA_INDEX = 0",
            self.table
        )
    }

    pub fn delete_unit(&self) -> String {
        format!("DELETE FROM {} WHERE SERVER_NAME = ? AND SERVICE_ID = ? AND RU_ID = ?", self.table)
    }
}
