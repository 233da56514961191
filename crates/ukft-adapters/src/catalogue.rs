use async_trait::async_trait;
use tracing::info;
use ukft_core::{Category, RawAmount, RawScheme, SchemeSource};
use ukft_storage::HttpFetcher;

use crate::{
    AdapterContext, AdapterError, Crawlability, SourceAdapter, ACADEMIES_SOURCE_ID,
    FOUNDATIONS_SOURCE_ID,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogueScheme {
    pub title: &'static str,
    pub description: &'static str,
    pub career_stage: &'static str,
    pub amount: RawAmount,
    pub deadline: &'static str,
    pub frequency: &'static str,
    pub tags: &'static [&'static str],
    pub success_rate: Option<&'static str>,
}

/// A funding body whose schemes are published as a fixed list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogueBody {
    pub subcategory: &'static str,
    pub name: &'static str,
    pub base_url: &'static str,
    pub funding_url: &'static str,
    pub disciplines: &'static [&'static str],
    pub contact_email: &'static str,
    /// Foundations point applicants at their home page. Academies leave the application link
    /// blank and send readers to their funding page for guidelines.
    pub links_to_base_url: bool,
    pub schemes: &'static [CatalogueScheme],
}

impl CatalogueBody {
    fn source(&self, category: Category) -> SchemeSource {
        let (application_url, guidelines_url) = if self.links_to_base_url {
            (self.base_url.to_string(), self.base_url.to_string())
        } else {
            (String::new(), self.funding_url.to_string())
        };
        SchemeSource {
            organization: self.name.to_string(),
            category,
            subcategory: self.subcategory.to_string(),
            disciplines: self.disciplines.iter().map(|d| d.to_string()).collect(),
            source_url: self.base_url.to_string(),
            application_url,
            guidelines_url,
            contact_email: self.contact_email.to_string(),
            contact_phone: String::new(),
        }
    }

    pub fn raw_schemes(&self, category: Category) -> Vec<RawScheme> {
        let source = self.source(category);
        self.schemes
            .iter()
            .map(|scheme| RawScheme {
                title: scheme.title.to_string(),
                description: scheme.description.to_string(),
                career_stage: scheme.career_stage.to_string(),
                amount: scheme.amount,
                deadline: scheme.deadline.to_string(),
                frequency: scheme.frequency.to_string(),
                tags: scheme.tags.iter().map(|t| t.to_string()).collect(),
                success_rate: scheme.success_rate.map(str::to_string),
                requirements: Vec::new(),
                source: source.clone(),
            })
            .collect()
    }
}

const fn amount(min: u64, max: u64, duration_years: u32) -> RawAmount {
    RawAmount {
        min,
        max,
        duration_years,
    }
}

pub const ACADEMIES: &[CatalogueBody] = &[
    CatalogueBody {
        subcategory: "royal_society",
        name: "The Royal Society",
        base_url: "https://royalsociety.org",
        funding_url: "https://royalsociety.org/grants-schemes-awards/",
        disciplines: &["Natural Sciences", "Engineering", "Mathematics"],
        contact_email: "",
        links_to_base_url: false,
        schemes: &[
            CatalogueScheme {
                title: "University Research Fellowships",
                description: "Support for outstanding early career scientists to establish independent research careers",
                career_stage: "Early Career",
                amount: amount(400_000, 500_000, 5),
                deadline: "2024-09-15",
                frequency: "Annual",
                tags: &["fellowship", "early-career", "independence"],
                success_rate: None,
            },
            CatalogueScheme {
                title: "Research Grants",
                description: "Funding for research projects across the natural sciences",
                career_stage: "All Stages",
                amount: amount(50_000, 200_000, 3),
                deadline: "2024-05-30",
                frequency: "Bi-annual",
                tags: &["research-grant", "natural-sciences"],
                success_rate: None,
            },
            CatalogueScheme {
                title: "International Exchanges",
                description: "Support for international collaboration and mobility",
                career_stage: "All Stages",
                amount: amount(10_000, 50_000, 1),
                deadline: "2024-04-15",
                frequency: "Multiple rounds",
                tags: &["international", "collaboration", "mobility"],
                success_rate: None,
            },
        ],
    },
    CatalogueBody {
        subcategory: "british_academy",
        name: "The British Academy",
        base_url: "https://www.thebritishacademy.ac.uk",
        funding_url: "https://www.thebritishacademy.ac.uk/funding/",
        disciplines: &["Humanities", "Social Sciences"],
        contact_email: "",
        links_to_base_url: false,
        schemes: &[
            CatalogueScheme {
                title: "Postdoctoral Fellowships",
                description: "Support for early career researchers in humanities and social sciences",
                career_stage: "Early Career",
                amount: amount(250_000, 300_000, 3),
                deadline: "2024-10-31",
                frequency: "Annual",
                tags: &["fellowship", "postdoctoral", "humanities"],
                success_rate: None,
            },
            CatalogueScheme {
                title: "Small Research Grants",
                description: "Funding for small-scale research projects",
                career_stage: "All Stages",
                amount: amount(1_000, 10_000, 1),
                deadline: "2024-03-31",
                frequency: "Annual",
                tags: &["small-grant", "research-project"],
                success_rate: None,
            },
        ],
    },
    CatalogueBody {
        subcategory: "royal_academy_engineering",
        name: "The Royal Academy of Engineering",
        base_url: "https://raeng.org.uk",
        funding_url: "https://raeng.org.uk/grants-prizes",
        disciplines: &["Engineering", "Technology"],
        contact_email: "",
        links_to_base_url: false,
        schemes: &[
            CatalogueScheme {
                title: "Research Fellowships",
                description: "Support for outstanding early career engineers",
                career_stage: "Early Career",
                amount: amount(500_000, 600_000, 5),
                deadline: "2024-08-15",
                frequency: "Annual",
                tags: &["fellowship", "engineering", "early-career"],
                success_rate: None,
            },
            CatalogueScheme {
                title: "Enterprise Fellowships",
                description: "Support for engineers to commercialize their research",
                career_stage: "Mid Career",
                amount: amount(75_000, 100_000, 2),
                deadline: "2024-06-30",
                frequency: "Annual",
                tags: &["fellowship", "enterprise", "commercialization"],
                success_rate: None,
            },
        ],
    },
    CatalogueBody {
        subcategory: "academy_medical_sciences",
        name: "The Academy of Medical Sciences",
        base_url: "https://acmedsci.ac.uk",
        funding_url: "https://acmedsci.ac.uk/grants-and-schemes",
        disciplines: &["Medical Sciences", "Biomedical Research"],
        contact_email: "",
        links_to_base_url: false,
        schemes: &[
            CatalogueScheme {
                title: "Starter Grants for Clinical Lecturers",
                description: "Support for clinical academics to establish independent research",
                career_stage: "Early Career",
                amount: amount(100_000, 150_000, 2),
                deadline: "2024-07-31",
                frequency: "Annual",
                tags: &["clinical", "lecturer", "medical-research"],
                success_rate: None,
            },
            CatalogueScheme {
                title: "Newton Advanced Fellowships",
                description: "International fellowships for mid-career researchers",
                career_stage: "Mid Career",
                amount: amount(200_000, 300_000, 2),
                deadline: "2024-05-15",
                frequency: "Annual",
                tags: &["fellowship", "international", "newton"],
                success_rate: None,
            },
        ],
    },
];

pub const FOUNDATIONS: &[CatalogueBody] = &[
    CatalogueBody {
        subcategory: "wellcome_trust",
        name: "The Wellcome Trust",
        base_url: "https://wellcome.org",
        funding_url: "https://wellcome.org/grant-funding",
        disciplines: &["Biomedical Research", "Medical Humanities", "Global Health"],
        contact_email: "grantsenquiries@wellcome.org",
        links_to_base_url: true,
        schemes: &[
            CatalogueScheme {
                title: "Discovery Awards",
                description: "Funding for curiosity-driven research across the biomedical sciences",
                career_stage: "All Stages",
                amount: amount(300_000, 3_000_000, 5),
                deadline: "2024-04-30",
                frequency: "Bi-annual",
                tags: &["discovery", "biomedical", "curiosity-driven"],
                success_rate: Some("12%"),
            },
            CatalogueScheme {
                title: "Career Development Awards",
                description: "Support for researchers to develop independent careers",
                career_stage: "Early Career",
                amount: amount(250_000, 1_500_000, 5),
                deadline: "2024-06-15",
                frequency: "Annual",
                tags: &["career-development", "independence", "biomedical"],
                success_rate: Some("18%"),
            },
            CatalogueScheme {
                title: "Senior Research Fellowships",
                description: "Support for exceptional researchers to pursue ambitious programmes",
                career_stage: "Senior",
                amount: amount(1_000_000, 3_000_000, 7),
                deadline: "2024-09-30",
                frequency: "Annual",
                tags: &["senior", "fellowship", "ambitious-research"],
                success_rate: Some("8%"),
            },
            CatalogueScheme {
                title: "International Training Fellowships",
                description: "Training opportunities for researchers from low- and middle-income countries",
                career_stage: "Early Career",
                amount: amount(150_000, 300_000, 3),
                deadline: "2024-05-31",
                frequency: "Annual",
                tags: &["international", "training", "global-health"],
                success_rate: Some("25%"),
            },
        ],
    },
    CatalogueBody {
        subcategory: "leverhulme_trust",
        name: "The Leverhulme Trust",
        base_url: "https://www.leverhulme.ac.uk",
        funding_url: "https://www.leverhulme.ac.uk/funding",
        disciplines: &["All Academic Disciplines"],
        contact_email: "enquiries@leverhulme.ac.uk",
        links_to_base_url: true,
        schemes: &[
            CatalogueScheme {
                title: "Research Project Grants",
                description: "Support for original research projects across all disciplines",
                career_stage: "All Stages",
                amount: amount(50_000, 500_000, 3),
                deadline: "2024-02-28",
                frequency: "Annual",
                tags: &["project-grant", "interdisciplinary", "original-research"],
                success_rate: Some("25%"),
            },
            CatalogueScheme {
                title: "Early Career Fellowships",
                description: "Support for early career researchers to develop independence",
                career_stage: "Early Career",
                amount: amount(200_000, 300_000, 3),
                deadline: "2024-01-31",
                frequency: "Annual",
                tags: &["fellowship", "early-career", "independence"],
                success_rate: Some("20%"),
            },
            CatalogueScheme {
                title: "Major Research Fellowships",
                description: "Support for established researchers to pursue major projects",
                career_stage: "Senior",
                amount: amount(400_000, 800_000, 3),
                deadline: "2024-11-30",
                frequency: "Annual",
                tags: &["fellowship", "major-project", "established-researcher"],
                success_rate: Some("15%"),
            },
            CatalogueScheme {
                title: "International Academic Fellowships",
                description: "Support for international collaboration and mobility",
                career_stage: "All Stages",
                amount: amount(100_000, 250_000, 2),
                deadline: "2024-03-31",
                frequency: "Annual",
                tags: &["international", "collaboration", "mobility"],
                success_rate: Some("30%"),
            },
        ],
    },
    CatalogueBody {
        subcategory: "nuffield_foundation",
        name: "Nuffield Foundation",
        base_url: "https://www.nuffieldfoundation.org",
        funding_url: "https://www.nuffieldfoundation.org/grants-and-funding",
        disciplines: &["Education", "Justice", "Welfare"],
        contact_email: "info@nuffieldfoundation.org",
        links_to_base_url: true,
        schemes: &[
            CatalogueScheme {
                title: "Oliver Bird Rheumatism Programme",
                description: "Research into rheumatic diseases and musculoskeletal conditions",
                career_stage: "All Stages",
                amount: amount(100_000, 400_000, 3),
                deadline: "2024-04-15",
                frequency: "Annual",
                tags: &["rheumatism", "musculoskeletal", "medical-research"],
                success_rate: Some("22%"),
            },
            CatalogueScheme {
                title: "Justice Innovation Programme",
                description: "Research and innovation to improve justice systems",
                career_stage: "All Stages",
                amount: amount(50_000, 200_000, 2),
                deadline: "2024-06-30",
                frequency: "Annual",
                tags: &["justice", "innovation", "social-research"],
                success_rate: Some("28%"),
            },
            CatalogueScheme {
                title: "Education Programme",
                description: "Research to improve educational outcomes and opportunities",
                career_stage: "All Stages",
                amount: amount(75_000, 300_000, 2),
                deadline: "2024-09-15",
                frequency: "Annual",
                tags: &["education", "outcomes", "opportunities"],
                success_rate: Some("24%"),
            },
        ],
    },
    CatalogueBody {
        subcategory: "wolfson_foundation",
        name: "The Wolfson Foundation",
        base_url: "https://www.wolfson.org.uk",
        funding_url: "https://www.wolfson.org.uk/funding",
        disciplines: &["Science", "Medicine", "Arts", "Humanities"],
        contact_email: "info@wolfson.org.uk",
        links_to_base_url: true,
        schemes: &[
            CatalogueScheme {
                title: "Research Excellence Awards",
                description: "Support for excellence in science and medicine research",
                career_stage: "All Stages",
                amount: amount(200_000, 1_000_000, 3),
                deadline: "2024-05-31",
                frequency: "Annual",
                tags: &["excellence", "science", "medicine"],
                success_rate: Some("18%"),
            },
            CatalogueScheme {
                title: "Arts and Humanities Grants",
                description: "Funding for outstanding projects in arts and humanities",
                career_stage: "All Stages",
                amount: amount(100_000, 500_000, 2),
                deadline: "2024-07-31",
                frequency: "Annual",
                tags: &["arts", "humanities", "outstanding-projects"],
                success_rate: Some("20%"),
            },
            CatalogueScheme {
                title: "Health and Disability Grants",
                description: "Support for research into health and disability issues",
                career_stage: "All Stages",
                amount: amount(150_000, 600_000, 3),
                deadline: "2024-08-31",
                frequency: "Annual",
                tags: &["health", "disability", "social-impact"],
                success_rate: Some("22%"),
            },
        ],
    },
];

/// Serves a fixed catalogue of bodies; never touches the network.
#[derive(Debug, Clone, Copy)]
pub struct StaticCatalogueAdapter {
    source_id: &'static str,
    category: Category,
    bodies: &'static [CatalogueBody],
}

impl StaticCatalogueAdapter {
    pub fn bodies(&self) -> &'static [CatalogueBody] {
        self.bodies
    }

    pub fn raw_schemes(&self) -> Vec<RawScheme> {
        self.bodies
            .iter()
            .flat_map(|body| {
                let schemes = body.raw_schemes(self.category);
                info!(body = body.name, schemes = schemes.len(), "catalogue body collected");
                schemes
            })
            .collect()
    }
}

#[async_trait]
impl SourceAdapter for StaticCatalogueAdapter {
    fn source_id(&self) -> &'static str {
        self.source_id
    }

    fn category(&self) -> Category {
        self.category
    }

    fn crawlability(&self) -> Crawlability {
        Crawlability::StaticCatalogue
    }

    async fn collect(
        &self,
        _http: &HttpFetcher,
        _ctx: &AdapterContext,
    ) -> Result<Vec<RawScheme>, AdapterError> {
        Ok(self.raw_schemes())
    }
}

pub fn academies_adapter() -> StaticCatalogueAdapter {
    StaticCatalogueAdapter {
        source_id: ACADEMIES_SOURCE_ID,
        category: Category::Academies,
        bodies: ACADEMIES,
    }
}

pub fn foundations_adapter() -> StaticCatalogueAdapter {
    StaticCatalogueAdapter {
        source_id: FOUNDATIONS_SOURCE_ID,
        category: Category::Foundations,
        bodies: FOUNDATIONS,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use ukft_core::{build_record, is_valid, PriorityLevel};
    use ukft_storage::HttpClientConfig;

    #[test]
    fn academies_catalogue_shape() {
        let schemes = academies_adapter().raw_schemes();
        assert_eq!(schemes.len(), 9);
        assert!(schemes.iter().all(|s| s.source.category == Category::Academies));
        assert!(schemes.iter().all(|s| s.source.application_url.is_empty()));
        assert!(schemes.iter().all(|s| s.success_rate.is_none()));

        let rae = schemes
            .iter()
            .find(|s| s.source.subcategory == "royal_academy_engineering")
            .unwrap();
        assert_eq!(rae.source.disciplines, vec!["Engineering", "Technology"]);
        assert_eq!(rae.source.guidelines_url, "https://raeng.org.uk/grants-prizes");
        assert!(schemes.iter().all(|s| !s.source.guidelines_url.is_empty()
            && s.source.guidelines_url != s.source.source_url));
    }

    #[test]
    fn foundations_carry_contacts_and_links() {
        let schemes = foundations_adapter().raw_schemes();
        assert_eq!(schemes.len(), 14);
        let nuffield: Vec<_> = schemes
            .iter()
            .filter(|s| s.source.organization == "Nuffield Foundation")
            .collect();
        assert_eq!(nuffield.len(), 3);
        assert!(nuffield.iter().all(|s| {
            s.source.contact_email == "info@nuffieldfoundation.org"
                && s.source.application_url == "https://www.nuffieldfoundation.org"
                && s.source.guidelines_url == s.source.application_url
        }));
        assert!(schemes.iter().all(|s| s.success_rate.is_some()));
    }

    #[test]
    fn catalogue_records_build_valid_with_distinct_ids() {
        let mut ids = HashSet::new();
        for raw in academies_adapter()
            .raw_schemes()
            .iter()
            .chain(foundations_adapter().raw_schemes().iter())
        {
            let record = build_record(raw);
            assert!(is_valid(&record.to_document().unwrap()));
            assert!(ids.insert(record.id.clone()), "duplicate id {}", record.id);
        }
        assert_eq!(ids.len(), 23);
    }

    #[test]
    fn wellcome_discovery_awards_derivations() {
        let schemes = foundations_adapter().raw_schemes();
        let discovery = schemes.iter().find(|s| s.title == "Discovery Awards").unwrap();
        let record = build_record(discovery);
        assert_eq!(record.key_info.priority_level, PriorityLevel::VeryHigh);
        assert_eq!(record.key_info.competition_level, "Very Competitive");
        assert_eq!(record.application.next_deadline, "2024-10-27");
    }

    #[tokio::test]
    async fn collect_needs_no_network() {
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let ctx = AdapterContext::new(uuid::Uuid::new_v4(), chrono::Utc::now());
        let schemes = foundations_adapter().collect(&http, &ctx).await.unwrap();
        assert_eq!(schemes.len(), 14);
    }
}
