pub fn render_schema() -> String {
	expand_includes(include_str!("../../../sql/init.sql"))
}

pub fn render_vector_schema() -> String {
	expand_includes(include_str!("../../../sql/vectors.sql"))
}

fn expand_includes(sql: &str) -> String {
	let mut out = String::new();

	for line in sql.lines() {
		let trimmed = line.trim();

		if let Some(path) = trimmed.strip_prefix("\\ir ") {
			match path.trim() {
				"tables/001_records.sql" =>
					out.push_str(include_str!("../../../sql/tables/001_records.sql")),
				"tables/002_mutation_queue.sql" =>
					out.push_str(include_str!("../../../sql/tables/002_mutation_queue.sql")),
				"tables/003_vector_index.sql" =>
					out.push_str(include_str!("../../../sql/tables/003_vector_index.sql")),
				_ => out.push_str(line),
			}
		} else {
			out.push_str(line);
		}

		out.push('\n');
	}

	out
}
